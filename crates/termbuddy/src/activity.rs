// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local activity detection.
//!
//! [`ActivityMonitor`] turns key presses into a presence state: any key
//! makes the user `TYPING`, and a quiet period flips them back to `IDLE`.
//! Key presses come either from the terminal (every input line) or from a
//! system-wide keyboard source shared through a [`KeyboardHub`].

use crate::protocol::ActivityState;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable selecting the key source.
pub const ACTIVITY_SOURCE_ENV: &str = "TERMBUDDY_ACTIVITY_SOURCE";

/// Where key presses come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivitySource {
    /// Lines typed into this terminal.
    #[default]
    Terminal,
    /// System-wide keyboard events.
    Keyboard,
}

impl FromStr for ActivitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminal" => Ok(Self::Terminal),
            "keyboard" | "xinput" => Ok(Self::Keyboard),
            other => Err(format!(
                "unknown activity source '{}' (expected terminal or keyboard)",
                other
            )),
        }
    }
}

impl std::fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal => f.write_str("terminal"),
            Self::Keyboard => f.write_str("keyboard"),
        }
    }
}

/// Typing/idle classification from key presses.
#[derive(Debug)]
pub struct ActivityMonitor {
    idle_after: Duration,
    state: ActivityState,
    last_activity: Option<Instant>,
    key_presses: u64,
}

impl ActivityMonitor {
    /// Starts `IDLE`.
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            state: ActivityState::Idle,
            last_activity: None,
            key_presses: 0,
        }
    }

    /// Returns the new state if it changed.
    pub fn record_key_press(&mut self, now: Instant) -> Option<ActivityState> {
        self.key_presses += 1;
        self.last_activity = Some(now);
        self.transition(ActivityState::Typing)
    }

    /// Flip to `IDLE` once the quiet period has elapsed.
    ///
    /// Returns the new state if it changed.
    pub fn poll(&mut self, now: Instant) -> Option<ActivityState> {
        let last = self.last_activity?;
        if self.state == ActivityState::Typing
            && now.saturating_duration_since(last) >= self.idle_after
        {
            return self.transition(ActivityState::Idle);
        }
        None
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn key_presses(&self) -> u64 {
        self.key_presses
    }

    fn transition(&mut self, next: ActivityState) -> Option<ActivityState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

/// One key-down notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress;

/// A system keyboard source.
pub trait KeyboardBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Start delivering key presses to `keys`. Aborting the returned task
    /// must stop the source.
    fn start(&self, keys: broadcast::Sender<KeyPress>) -> Result<JoinHandle<()>, ActivityError>;
}

/// `xinput test-xi2 --root` on X11.
#[derive(Debug, Default)]
pub struct XinputBackend;

/// True for `xinput test-xi2` lines announcing a key-down event.
pub fn is_xinput_key_press(line: &str) -> bool {
    line.contains("KeyPress")
}

impl KeyboardBackend for XinputBackend {
    fn name(&self) -> &'static str {
        "xinput"
    }

    fn start(&self, keys: broadcast::Sender<KeyPress>) -> Result<JoinHandle<()>, ActivityError> {
        if std::env::var_os("DISPLAY").is_none() {
            return Err(ActivityError::Unavailable("DISPLAY is not set".into()));
        }

        let mut child = Command::new("xinput")
            .args(["test-xi2", "--root"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActivityError::Spawn(format!("xinput: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ActivityError::Spawn("xinput: no stdout".into()))?;

        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if is_xinput_key_press(&line) {
                            let _ = keys.send(KeyPress);
                        }
                    }
                    Ok(None) => {
                        warn!("xinput exited; keyboard activity unavailable");
                        break;
                    }
                    Err(e) => {
                        warn!("xinput read error: {}", e);
                        break;
                    }
                }
            }
            // The child is killed when dropped.
            drop(child);
        }))
    }
}

struct HubState {
    subscribers: usize,
    keys: Option<broadcast::Sender<KeyPress>>,
    task: Option<JoinHandle<()>>,
}

struct HubInner {
    backend: Box<dyn KeyboardBackend>,
    state: Mutex<HubState>,
}

/// Reference-counted access to one keyboard backend.
///
/// The first [`acquire`](Self::acquire) starts the backend; dropping the
/// last [`KeyboardSubscription`] stops it.
#[derive(Clone)]
pub struct KeyboardHub {
    inner: Arc<HubInner>,
}

impl KeyboardHub {
    pub fn new(backend: impl KeyboardBackend) -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend: Box::new(backend),
                state: Mutex::new(HubState {
                    subscribers: 0,
                    keys: None,
                    task: None,
                }),
            }),
        }
    }

    pub fn xinput() -> Self {
        Self::new(XinputBackend)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> Result<KeyboardSubscription, ActivityError> {
        let mut state = self.state();
        let rx = match &state.keys {
            Some(keys) => keys.subscribe(),
            None => {
                let (keys, rx) = broadcast::channel(256);
                let task = self.inner.backend.start(keys.clone())?;
                info!("Keyboard backend '{}' started", self.inner.backend.name());
                state.keys = Some(keys);
                state.task = Some(task);
                rx
            }
        };
        state.subscribers += 1;
        Ok(KeyboardSubscription {
            hub: self.clone(),
            rx,
        })
    }

    fn release(&self) {
        let mut state = self.state();
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers == 0 {
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.keys = None;
            debug!("Keyboard backend '{}' stopped", self.inner.backend.name());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers
    }

    pub fn is_running(&self) -> bool {
        self.state().task.is_some()
    }
}

/// A live claim on the hub; releases it when dropped.
pub struct KeyboardSubscription {
    hub: KeyboardHub,
    rx: broadcast::Receiver<KeyPress>,
}

impl KeyboardSubscription {
    /// Next key press, or `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<KeyPress> {
        loop {
            match self.rx.recv().await {
                Ok(key) => return Some(key),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for KeyboardSubscription {
    fn drop(&mut self) {
        self.hub.release();
    }
}

/// Activity error types.
#[derive(Debug)]
pub enum ActivityError {
    Unavailable(String),
    Spawn(String),
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(s) => write!(f, "Keyboard source unavailable: {}", s),
            Self::Spawn(s) => write!(f, "Failed to start keyboard source: {}", s),
        }
    }
}

impl std::error::Error for ActivityError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_monitor_typing_then_idle() {
        let t0 = Instant::now();
        let mut monitor = ActivityMonitor::new(ms(1500));
        assert_eq!(monitor.state(), ActivityState::Idle);
        assert_eq!(monitor.poll(t0), None);

        assert_eq!(monitor.record_key_press(t0), Some(ActivityState::Typing));
        assert_eq!(monitor.record_key_press(t0 + ms(100)), None);
        assert_eq!(monitor.poll(t0 + ms(1500)), None);
        assert_eq!(monitor.poll(t0 + ms(1600)), Some(ActivityState::Idle));
        assert_eq!(monitor.poll(t0 + ms(5000)), None);
        assert_eq!(monitor.key_presses(), 2);
    }

    #[test]
    fn test_activity_source_parse() {
        assert_eq!("terminal".parse(), Ok(ActivitySource::Terminal));
        assert_eq!("Keyboard".parse(), Ok(ActivitySource::Keyboard));
        assert_eq!("xinput".parse(), Ok(ActivitySource::Keyboard));
        assert!("mouse".parse::<ActivitySource>().is_err());
    }

    #[test]
    fn test_xinput_line_filter() {
        assert!(is_xinput_key_press("EVENT type 13 (RawKeyPress)"));
        assert!(is_xinput_key_press("EVENT type 2 (KeyPress)"));
        assert!(!is_xinput_key_press("EVENT type 3 (KeyRelease)"));
        assert!(!is_xinput_key_press("    detail: 38"));
    }

    /// Emits one key press per start and counts starts.
    struct FakeBackend {
        starts: Arc<AtomicUsize>,
    }

    impl KeyboardBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn start(&self, keys: broadcast::Sender<KeyPress>) -> Result<JoinHandle<()>, ActivityError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(tokio::spawn(async move {
                loop {
                    let _ = keys.send(KeyPress);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }))
        }
    }

    struct BrokenBackend;

    impl KeyboardBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn start(&self, _keys: broadcast::Sender<KeyPress>) -> Result<JoinHandle<()>, ActivityError> {
            Err(ActivityError::Unavailable("no device".into()))
        }
    }

    #[tokio::test]
    async fn test_hub_refcounts_backend() {
        let starts = Arc::new(AtomicUsize::new(0));
        let hub = KeyboardHub::new(FakeBackend {
            starts: starts.clone(),
        });
        assert!(!hub.is_running());

        let mut first = hub.acquire().unwrap();
        let second = hub.acquire().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(first.recv().await, Some(KeyPress));

        drop(second);
        assert!(hub.is_running());
        drop(first);
        assert!(!hub.is_running());
        assert_eq!(hub.subscriber_count(), 0);

        let _again = hub.acquire().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hub_start_failure() {
        let hub = KeyboardHub::new(BrokenBackend);
        assert!(matches!(hub.acquire(), Err(ActivityError::Unavailable(_))));
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.is_running());
    }
}
