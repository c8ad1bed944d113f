// src/alarm/client.rs

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDateTime;
use log::debug;

use super::digest::DigestChallenge;
use crate::config::AlarmConfig;
use crate::error::PollError;

const CGI_PATH: &str = "/cgi-bin/mediaFileFind.cgi";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Opaque search object token issued by the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub channel: u32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub storage_path: String,
}

/// One row returned by `find_next`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRow {
    pub events: Vec<String>,
    pub cluster: Option<u64>,
}

impl EventRow {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.events.iter().any(|e| e.eq_ignore_ascii_case(tag))
    }
}

/// Stateful search protocol of the external event source.
///
/// Every handle returned by `create_search` must be released with `destroy`;
/// see [`super::SearchSession`].
pub trait EventSource: Send + Sync {
    fn create_search(&self) -> Result<SearchHandle, PollError>;
    /// `false` when the device reports nothing to iterate.
    fn find_events(&self, handle: &SearchHandle, query: &EventQuery) -> Result<bool, PollError>;
    /// Next page of at most `count` rows; an empty page means exhausted.
    fn find_next(&self, handle: &SearchHandle, count: u32) -> Result<Vec<EventRow>, PollError>;
    fn destroy(&self, handle: &SearchHandle) -> Result<(), PollError>;
}

/// Blocking client for the `mediaFileFind.cgi` interface, digest authenticated.
pub struct CgiEventClient {
    base_url: String,
    user: String,
    password: String,
    agent: ureq::Agent,
    challenge: Mutex<Option<(DigestChallenge, u32)>>,
}

impl CgiEventClient {
    pub fn new(cfg: &AlarmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build();

        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            agent,
            challenge: Mutex::new(None),
        }
    }

    fn authorization(&self, uri: &str) -> Option<String> {
        let mut guard = self.challenge.lock().ok()?;
        let (challenge, nc) = guard.as_mut()?;
        *nc += 1;
        let cnonce = format!("{:016x}", rand::random::<u64>());
        Some(challenge.authorization(&self.user, &self.password, "GET", uri, *nc, &cnonce))
    }

    fn store_challenge(&self, header: Option<&str>) -> Result<(), PollError> {
        let challenge = header
            .and_then(DigestChallenge::parse)
            .ok_or_else(|| PollError::Http("401 without digest challenge".into()))?;
        if let Ok(mut guard) = self.challenge.lock() {
            *guard = Some((challenge, 0));
        }
        Ok(())
    }

    /// GET `CGI_PATH?query`, answering one digest challenge if needed.
    fn get(&self, query: &str) -> Result<String, PollError> {
        let uri = format!("{}?{}", CGI_PATH, query);
        let url = format!("{}{}", self.base_url, uri);

        for attempt in 0..2 {
            let mut req = self.agent.get(&url);
            if let Some(auth) = self.authorization(&uri) {
                req = req.set("Authorization", &auth);
            }

            match req.call() {
                Ok(resp) => {
                    return resp
                        .into_string()
                        .map_err(|e| PollError::Http(e.to_string()));
                }
                Err(ureq::Error::Status(401, resp)) if attempt == 0 => {
                    debug!("[alarm] digest challenge from {}", self.base_url);
                    self.store_challenge(resp.header("WWW-Authenticate"))?;
                }
                Err(ureq::Error::Status(code, resp)) => {
                    return Err(PollError::Http(format!(
                        "status {} {}",
                        code,
                        resp.status_text()
                    )));
                }
                Err(e) => return Err(PollError::Http(e.to_string())),
            }
        }

        Err(PollError::Http("authentication rejected".into()))
    }
}

impl EventSource for CgiEventClient {
    fn create_search(&self) -> Result<SearchHandle, PollError> {
        let body = self.get("action=factory.create")?;
        parse_handle(&body)
    }

    fn find_events(&self, handle: &SearchHandle, query: &EventQuery) -> Result<bool, PollError> {
        let q = format!(
            "action=findFile&object={}&condition.Channel={}&condition.StartTime={}&condition.EndTime={}&condition.Dirs[0]={}&condition.Types[0]=dav&condition.Flags[0]=Event",
            handle.0,
            query.channel,
            urlencoding::encode(&query.start.format(TIME_FORMAT).to_string()),
            urlencoding::encode(&query.end.format(TIME_FORMAT).to_string()),
            urlencoding::encode(&query.storage_path),
        );
        let body = self.get(&q)?;
        Ok(body.trim().eq_ignore_ascii_case("OK"))
    }

    fn find_next(&self, handle: &SearchHandle, count: u32) -> Result<Vec<EventRow>, PollError> {
        let body = self.get(&format!(
            "action=findNextFile&object={}&count={}",
            handle.0, count
        ))?;
        Ok(parse_rows(&body))
    }

    fn destroy(&self, handle: &SearchHandle) -> Result<(), PollError> {
        let close = self.get(&format!("action=close&object={}", handle.0));
        self.get(&format!("action=destroy&object={}", handle.0))?;
        close.map(|_| ())
    }
}

/// `result=08137` → handle.
pub fn parse_handle(body: &str) -> Result<SearchHandle, PollError> {
    body.lines()
        .filter_map(|l| l.trim().strip_prefix("result="))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(|v| SearchHandle(v.to_string()))
        .ok_or_else(|| PollError::Protocol(format!("no search handle in {:?}", body.trim())))
}

/// `items[i].Field=value` lines → rows ordered by index.
pub fn parse_rows(body: &str) -> Vec<EventRow> {
    let mut rows: BTreeMap<usize, EventRow> = BTreeMap::new();

    for line in body.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let Some(rest) = key.strip_prefix("items[") else {
            continue;
        };
        let Some((idx, field)) = rest.split_once("].") else {
            continue;
        };
        let Ok(idx) = idx.parse::<usize>() else {
            continue;
        };

        let row = rows.entry(idx).or_default();
        if field == "Cluster" {
            row.cluster = value.trim().parse().ok();
        } else if field.starts_with("Events[") {
            row.events.push(value.trim().to_string());
        }
    }

    rows.into_values().collect()
}
