//! Hostname → App registry
//!
//! The registry is the only owner of the host map. Other components go through
//! [`lookup`](Registry::lookup), [`hit`](Registry::hit),
//! [`register`](Registry::register), [`sweep`](Registry::sweep) and
//! [`shutdown_all`](Registry::shutdown_all); first requests for a host are
//! funnelled through [`get_or_start`](Registry::get_or_start) so only one
//! start runs per host at a time.

use crate::app::{App, AppState};
use crate::error::{RegistryError, RouterError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type StartOutcome = Result<Arc<App>, RouterError>;
type SharedStart = Shared<BoxFuture<'static, StartOutcome>>;

/// Point-in-time view of one registered app
#[derive(Debug, Clone)]
pub struct AppStatus {
    pub host: String,
    pub state: AppState,
    pub target: String,
    pub pid: Option<u32>,
    pub idle_for: Duration,
    pub idle_limit: Duration,
}

/// Owns every running app, keyed by hostname
#[derive(Default)]
pub struct Registry {
    /// Running apps keyed by hostname
    apps: DashMap<String, Arc<App>>,
    /// Starts in progress keyed by hostname
    starting: Mutex<HashMap<String, SharedStart>>,
    /// Apps whose process is being started, reachable by shutdown
    launching: Mutex<HashMap<String, Arc<App>>>,
    /// Set by shutdown; no app is started or registered afterwards
    closed: AtomicBool,
    /// Held for the whole of a sweep or shutdown
    sweep_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Find the app serving `host`. Does not count as a hit.
    pub fn lookup(&self, host: &str) -> Option<Arc<App>> {
        self.apps.get(host).map(|entry| Arc::clone(entry.value()))
    }

    /// Refresh the idle timer of `host`, if registered
    pub fn hit(&self, host: &str) {
        if let Some(entry) = self.apps.get(host) {
            entry.value().hit();
        }
    }

    /// Insert a running app. Replacing an existing entry is an error.
    pub fn register(&self, host: &str, app: Arc<App>) -> Result<(), RegistryError> {
        match self.apps.entry(host.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(host.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(app);
                debug!(hostname = host, "App registered");
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Copy out the state of every registered app, sorted by host
    pub fn snapshot(&self) -> Vec<AppStatus> {
        let mut apps: Vec<AppStatus> = self
            .apps
            .iter()
            .map(|entry| {
                let app = entry.value();
                AppStatus {
                    host: entry.key().clone(),
                    state: app.state(),
                    target: app.target().to_string(),
                    pid: app.pid(),
                    idle_for: app.idle_for(),
                    idle_limit: app.idle_limit(),
                }
            })
            .collect();
        apps.sort_by(|a, b| a.host.cmp(&b.host));
        apps
    }

    /// Return the app for `host`, starting one if none is registered.
    ///
    /// Concurrent callers for the same host share a single start: `create` is
    /// invoked at most once per start attempt and every waiter receives the
    /// same outcome. The start runs on its own task, so a caller going away
    /// does not abort it.
    pub async fn get_or_start<F>(self: &Arc<Self>, host: &str, create: F) -> StartOutcome
    where
        F: FnOnce() -> Result<App, RouterError> + Send + 'static,
    {
        if let Some(app) = self.lookup(host) {
            return Ok(app);
        }
        if self.is_closed() {
            return Err(shutting_down());
        }

        let start = {
            let mut starting = self.starting.lock();
            match starting.get(host) {
                Some(in_progress) => {
                    debug!(hostname = host, "Waiting for start already in progress");
                    in_progress.clone()
                }
                None => {
                    let registry = Arc::clone(self);
                    let host_owned = host.to_string();
                    let task = tokio::spawn(async move {
                        registry.start_and_register(&host_owned, create).await
                    });
                    let start = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RouterError::Unknown(format!("Start task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    starting.insert(host.to_string(), start.clone());
                    start
                }
            }
        };

        start.await
    }

    async fn start_and_register<F>(&self, host: &str, create: F) -> StartOutcome
    where
        F: FnOnce() -> Result<App, RouterError>,
    {
        let outcome = async {
            // A start that finished just before ours was scheduled
            if let Some(app) = self.lookup(host) {
                return Ok(app);
            }
            if self.is_closed() {
                return Err(shutting_down());
            }

            let app = Arc::new(create()?);
            self.launching.lock().insert(host.to_string(), Arc::clone(&app));
            let started = app.start().await;
            self.launching.lock().remove(host);
            started?;

            // Shutdown began while the process was starting
            if self.is_closed() {
                app.stop().await;
                return Err(shutting_down());
            }

            if let Err(e) = self.register(host, Arc::clone(&app)) {
                app.stop().await;
                return Err(RouterError::Unknown(e.to_string()));
            }
            Ok(app)
        }
        .await;

        self.starting.lock().remove(host);
        outcome
    }

    /// Evict and stop every app that is idle past its limit or whose process
    /// has exited. Returns the evicted hostnames.
    pub async fn sweep(&self) -> Vec<String> {
        let _guard = self.sweep_lock.lock().await;

        let candidates: Vec<String> = self
            .apps
            .iter()
            .filter(|entry| is_evictable(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check under the entry lock so a concurrent hit wins
        let evicted: Vec<(String, Arc<App>)> = candidates
            .into_iter()
            .filter_map(|host| self.apps.remove_if(&host, |_, app| is_evictable(app)))
            .collect();

        if evicted.is_empty() {
            return Vec::new();
        }

        for (host, app) in &evicted {
            if app.is_alive() {
                info!(
                    hostname = %host,
                    idle_secs = app.idle_for().as_secs(),
                    "App idle timeout reached"
                );
            } else {
                warn!(hostname = %host, "App process exited unexpectedly, evicting");
            }
        }

        futures::future::join_all(evicted.iter().map(|(_, app)| app.stop())).await;

        evicted.into_iter().map(|(host, _)| host).collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop every app and clear the map.
    ///
    /// Starts still in progress are stopped and awaited first, so no app is
    /// registered or left running once this returns; later starts are refused.
    pub async fn shutdown_all(&self) {
        let _guard = self.sweep_lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let launching: Vec<Arc<App>> = self.launching.lock().values().cloned().collect();
        if !launching.is_empty() {
            info!(count = launching.len(), "Stopping apps that are still starting");
        }
        futures::future::join_all(launching.iter().map(|app| app.stop())).await;

        let in_flight: Vec<SharedStart> = self.starting.lock().values().cloned().collect();
        futures::future::join_all(in_flight).await;

        let hosts: Vec<String> = self.apps.iter().map(|entry| entry.key().clone()).collect();
        let apps: Vec<Arc<App>> = hosts
            .iter()
            .filter_map(|host| self.apps.remove(host).map(|(_, app)| app))
            .collect();

        if !apps.is_empty() {
            info!(count = apps.len(), "Stopping all apps");
        }
        futures::future::join_all(apps.iter().map(|app| app.stop())).await;
    }
}

fn shutting_down() -> RouterError {
    RouterError::start_failure("Router is shutting down")
}

fn is_evictable(app: &App) -> bool {
    app.expired() || !app.is_alive()
}
