use std::collections::HashMap;
use std::fmt::Display;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Health reporting for the long running loops of a service.
///
/// Each loop registers a component and must keep reporting healthy before its deadline
/// passes. The registry is healthy only when at least one component is registered and every
/// registered component reported healthy recently. A component that stops reporting is
/// marked as stalled.
///
/// Liveness and readiness should each get their own registry.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered.
    Starting,
    /// Reported healthy, must report again before the deadline.
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Returns when the message is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Report healthy on `Ok`, unhealthy on `Err`.
    pub async fn report_result<T, E: Display>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.report_healthy().await,
            Err(error) => {
                warn!(component = %self.component, "component unhealthy: {}", error);
                self.report_status(ComponentStatus::Unhealthy).await
            }
        }
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        _ = map.insert(message.component, message.status);
                    }
                    // The probes will fail and the process restart.
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component. The returned handle goes to the component so it can report.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status computed from every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned HealthRegistry lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                _ => status.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
