//! Activity tracking for long-running device operations
//!
//! An [`ActivityTracker`] records which named activities a device is currently
//! performing and when each one started. Several activities may overlap
//! (a camera can be `StartingUp` and `CoolingDown` at the same time).
//!
//! The tracker is a capability that each device holds by value; the activity
//! enumeration is a type parameter so every device type keeps its own closed
//! set of names while sharing identical start/end semantics.
//!
//! All mutations go through a per-tracker mutex, so the pollers, the guiding
//! task and command handlers always observe a consistent active set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

/// Buffer size for activity event subscribers
const ACTIVITY_EVENT_BUFFER: usize = 64;

/// A named activity drawn from a closed, per-device enumeration
pub trait Activity: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Human-readable activity name used in logs and status snapshots
    fn name(&self) -> &'static str;
}

/// Misuse of the activity tracker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    #[error("{device}: activity {activity} is already active")]
    Duplicate { device: String, activity: String },

    #[error("{device}: activity {activity} is not active")]
    NotActive { device: String, activity: String },
}

/// Record of an activity that has ended
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedActivity<A> {
    pub activity: A,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Monotonic duration between start and end
    pub duration: Duration,
}

/// Transition notifications published by a tracker
#[derive(Debug, Clone)]
pub enum ActivityEvent<A> {
    Started { activity: A, at: DateTime<Utc> },
    Ended(CompletedActivity<A>),
}

#[derive(Debug, Clone, Copy)]
struct StartStamp {
    at: DateTime<Utc>,
    instant: Instant,
}

/// Set of active activities plus their start times, for one device
pub struct ActivityTracker<A: Activity> {
    device: String,
    active: Mutex<HashMap<A, StartStamp>>,
    events: broadcast::Sender<ActivityEvent<A>>,
}

impl<A: Activity> ActivityTracker<A> {
    /// Create an empty tracker. `device` labels log lines and errors.
    pub fn new(device: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(ACTIVITY_EVENT_BUFFER);
        Self {
            device: device.into(),
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<A, StartStamp>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `activity` as started now.
    ///
    /// Re-starting an already active activity is rejected and leaves the
    /// original start time untouched.
    pub fn start(&self, activity: A) -> Result<DateTime<Utc>, ActivityError> {
        let stamp = StartStamp {
            at: Utc::now(),
            instant: Instant::now(),
        };
        {
            let mut active = self.lock();
            if active.contains_key(&activity) {
                return Err(ActivityError::Duplicate {
                    device: self.device.clone(),
                    activity: activity.name().to_string(),
                });
            }
            active.insert(activity, stamp);
        }

        tracing::info!("{}: activity {} - started", self.device, activity.name());
        let _ = self.events.send(ActivityEvent::Started {
            activity,
            at: stamp.at,
        });
        Ok(stamp.at)
    }

    /// End `activity`, returning how long it ran.
    pub fn end(&self, activity: A) -> Result<CompletedActivity<A>, ActivityError> {
        let stamp = self.lock().remove(&activity).ok_or_else(|| ActivityError::NotActive {
            device: self.device.clone(),
            activity: activity.name().to_string(),
        })?;

        let completed = CompletedActivity {
            activity,
            started_at: stamp.at,
            ended_at: Utc::now(),
            duration: stamp.instant.elapsed(),
        };
        tracing::info!(
            "{}: activity {} - ended (duration: {:.3}s)",
            self.device,
            activity.name(),
            completed.duration.as_secs_f64()
        );
        let _ = self.events.send(ActivityEvent::Ended(completed.clone()));
        Ok(completed)
    }

    /// End `activity` if it is active; a no-op otherwise
    pub fn end_if_active(&self, activity: A) -> Option<CompletedActivity<A>> {
        self.end(activity).ok()
    }

    pub fn is_active(&self, activity: A) -> bool {
        self.lock().contains_key(&activity)
    }

    /// Snapshot of the active activities, oldest first
    pub fn active(&self) -> Vec<A> {
        let active = self.lock();
        let mut entries: Vec<(A, Instant)> = active.iter().map(|(a, s)| (*a, s.instant)).collect();
        drop(active);
        entries.sort_by_key(|(_, instant)| *instant);
        entries.into_iter().map(|(a, _)| a).collect()
    }

    /// Names of the active activities, oldest first; `["Idle"]` when none are
    pub fn names(&self) -> Vec<String> {
        let active = self.active();
        if active.is_empty() {
            return vec!["Idle".to_string()];
        }
        active.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn started_at(&self, activity: A) -> Option<DateTime<Utc>> {
        self.lock().get(&activity).map(|s| s.at)
    }

    /// Time elapsed since `activity` started, if it is active
    pub fn elapsed(&self, activity: A) -> Option<Duration> {
        self.lock().get(&activity).map(|s| s.instant.elapsed())
    }

    /// Subscribe to start/end transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent<A>> {
        self.events.subscribe()
    }
}

impl<A: Activity> Debug for ActivityTracker<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("device", &self.device)
            .field("active", &self.active())
            .finish()
    }
}
