mod common;

use std::path::Path;

use courtcam_node::{ComposeError, ComposeRequest, SegmentStore};

use common::{FakeTool, pipeline, write_ring};

fn manifest_lines(body: &str) -> Vec<&str> {
    body.lines().filter(|l| l.starts_with("file '")).collect()
}

#[tokio::test]
async fn composes_recent_window_with_hd_watermark() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);
    write_ring(&store, 1, 20);

    let p = pipeline(store, FakeTool::with_height(1080), work_dir.path());
    let clip = p.compose(&ComposeRequest::recent(1, "42", 60)).await.unwrap();

    assert_eq!(clip.segments, 13);
    assert_eq!(clip.resolution.height, 1080);

    let body = std::fs::read_to_string(&clip.output).unwrap();
    let lines = manifest_lines(&body);
    assert_eq!(lines.len(), 13);
    assert!(lines[0].ends_with("buffer_1_007.mp4'"));
    assert!(lines[12].ends_with("buffer_1_004.mp4'"));
    assert!(body.ends_with("watermark /assets/watermark_1080.png\n"));

    // manifest is gone, intermediate and final belong to the caller
    assert!(!work_dir.path().join("video_camera_1_user_42.txt").exists());
    assert!(clip.intermediate.exists());
    clip.remove_files();
    assert!(!clip.intermediate.exists());
    assert!(!clip.output.exists());
}

#[tokio::test]
async fn standard_watermark_below_threshold() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);
    write_ring(&store, 1, 4);

    let p = pipeline(store, FakeTool::with_height(720), work_dir.path());
    let clip = p.compose(&ComposeRequest::recent(1, "7", 60)).await.unwrap();

    let body = std::fs::read_to_string(&clip.output).unwrap();
    assert!(body.ends_with("watermark /assets/watermark.png\n"));
    assert_eq!(clip.segments, 4);
}

#[tokio::test]
async fn concurrent_requesters_do_not_clobber() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);
    write_ring(&store, 1, 15);

    let p = pipeline(store, FakeTool::with_height(1080), work_dir.path());
    let short = ComposeRequest::recent(1, "alice", 10);
    let long = ComposeRequest::recent(1, "bob", 60);

    let (a, b) = tokio::join!(p.compose(&short), p.compose(&long));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.output, b.output);
    assert_ne!(a.intermediate, b.intermediate);

    let a_body = std::fs::read_to_string(&a.output).unwrap();
    let b_body = std::fs::read_to_string(&b.output).unwrap();
    assert_eq!(manifest_lines(&a_body).len(), 3);
    assert_eq!(manifest_lines(&b_body).len(), 13);
}

#[tokio::test]
async fn empty_buffer_skips_the_tool() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);

    let p = pipeline(store, FakeTool::with_height(1080), work_dir.path());
    let err = p.compose(&ComposeRequest::recent(9, "42", 60)).await.unwrap_err();

    assert!(matches!(err, ComposeError::EmptyBuffer(9)));
    assert!(p.tool().calls().is_empty());
}

#[tokio::test]
async fn probe_failure_is_not_retried() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);
    write_ring(&store, 1, 5);

    let p = pipeline(store, FakeTool::default(), work_dir.path());
    let err = p.compose(&ComposeRequest::recent(1, "42", 60)).await.unwrap_err();

    assert!(matches!(err, ComposeError::ProbeFailed(_)));
    assert_eq!(p.tool().calls(), vec!["probe buffer_1_000.mp4"]);
    assert_eq!(err.user_message(), "Could not assemble the video.");
}

#[tokio::test]
async fn failed_stages_leave_no_intermediates() {
    let seg_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(seg_dir.path(), "mp4", 5, 15);
    write_ring(&store, 1, 5);

    let concat_fails = FakeTool {
        fail_concat: true,
        ..FakeTool::with_height(720)
    };
    let p = pipeline(store.clone(), concat_fails, work_dir.path());
    let err = p.compose(&ComposeRequest::recent(1, "42", 60)).await.unwrap_err();
    assert!(matches!(err, ComposeError::ConcatFailed(_)));
    assert_eq!(leftovers(work_dir.path()), 0);

    let overlay_fails = FakeTool {
        fail_overlay: true,
        ..FakeTool::with_height(720)
    };
    let p = pipeline(store, overlay_fails, work_dir.path());
    let err = p.compose(&ComposeRequest::recent(1, "42", 60)).await.unwrap_err();
    assert!(matches!(err, ComposeError::OverlayFailed(_)));
    assert_eq!(leftovers(work_dir.path()), 0);
}

fn leftovers(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
