use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{TryStreamExt, stream::StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{Config as WatcherConfig, Event, watcher};
use kube::{Api, Client, ResourceExt, api::LogParams};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SourceError;
use crate::metrics::Metrics;
use crate::stream::{LogSource, StreamManager};
use crate::types::{LogLevel, MATCH_ALL, Target, TargetKey};
use crate::utils::{labels_match, parse_labels};

/// Reads container logs with `follow: false`, resuming after the newest line seen.
pub struct KubeLogSource {
    client: Client,
    first_window: Duration,
    cursors: Mutex<HashMap<TargetKey, DateTime<Utc>>>,
}

impl KubeLogSource {
    pub fn new(client: Client, first_window: Duration) -> Self {
        Self {
            client,
            first_window,
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn fetch(&self, target: &Target) -> Result<String, SourceError> {
        let key = &target.key;
        let cursor = self.cursors.lock().get(key).copied();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let lp = LogParams {
            follow: false,
            container: Some(key.container.clone()),
            timestamps: true,
            since_time: cursor,
            since_seconds: match cursor {
                Some(_) => None,
                None => Some(self.first_window.as_secs().max(1) as i64),
            },
            ..Default::default()
        };

        let raw = match api.logs(&key.pod, &lp).await {
            Ok(raw) => raw,
            // e.g. a container that is still waiting to start
            Err(kube::Error::Api(resp)) => return Err(SourceError::Fetch(resp.message)),
            Err(e) => return Err(e.into()),
        };
        let (text, newest) = strip_timestamps(&raw, cursor);
        if let Some(newest) = newest {
            self.cursors.lock().insert(key.clone(), newest);
        }
        Ok(text)
    }

    fn release(&self, key: &TargetKey) {
        self.cursors.lock().remove(key);
    }
}

/// Drops the RFC 3339 prefix `timestamps: true` adds and skips lines at or before `after`.
/// Returns the remaining text and the newest timestamp seen.
pub fn strip_timestamps(
    raw: &str,
    after: Option<DateTime<Utc>>,
) -> (String, Option<DateTime<Utc>>) {
    let mut newest = after;
    let mut lines = Vec::new();
    for line in raw.lines() {
        let Some((stamp, rest)) = line.split_once(' ') else {
            // A bare timestamp is an empty log line.
            continue;
        };
        match DateTime::parse_from_rfc3339(stamp) {
            Ok(ts) => {
                let ts = ts.with_timezone(&Utc);
                if after.is_some_and(|after| ts <= after) {
                    continue;
                }
                if newest.is_none_or(|n| ts > n) {
                    newest = Some(ts);
                }
                lines.push(rest);
            }
            Err(_) => lines.push(line),
        }
    }
    (lines.join("\n"), newest)
}

/// Annotation-driven stream settings shared by every container of a pod.
#[derive(Debug, Clone)]
pub struct Annotations {
    prefix: String,
}

impl Annotations {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn get<'a>(&self, annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
        annotations
            .get(&format!("{}.{}", self.prefix, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn enabled(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.get(annotations, "enabled") == Some("true")
    }

    /// Include labels must all match; any matching exclude label rejects the pod.
    pub fn labels_allowed(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        if let Some(include) = self.get(annotations, "include-labels")
            && !labels_match(labels, &parse_labels(include))
        {
            return false;
        }
        if let Some(exclude) = self.get(annotations, "exclude-labels") {
            let excluded = parse_labels(exclude);
            if excluded.iter().any(|(k, v)| labels.get(k) == Some(v)) {
                return false;
            }
        }
        true
    }

    /// Builds a target for one container, replacing invalid values with defaults.
    pub fn target(
        &self,
        key: TargetKey,
        annotations: &BTreeMap<String, String>,
        config: &Config,
    ) -> Target {
        let mut target = Target::new(key, config.slack.default_channel.clone());
        target.max_lines = config.kubernetes.default_max_lines;
        target.cooldown = Duration::from_secs(config.kubernetes.default_cooldown_secs);

        if let Some(channel) = self.get(annotations, "channel") {
            if channel.starts_with('#') {
                target.channel = channel.to_string();
            } else {
                warn!(
                    "Channel '{}' for {} must start with #, using {}",
                    channel, target.key, target.channel
                );
            }
        }
        if let Some(filter) = self.get(annotations, "filters") {
            if regex::Regex::new(filter).is_err() {
                warn!("Invalid filter regex '{}' for {}", filter, target.key);
            }
            target.filter = filter.to_string();
        } else {
            target.filter = MATCH_ALL.to_string();
        }
        if let Some(level) = self.get(annotations, "level") {
            match level.parse::<LogLevel>() {
                Ok(level) => target.min_level = level,
                Err(e) => warn!("{} for {}, using info", e, target.key),
            }
        }
        if let Some(max_lines) = self.get(annotations, "max-lines") {
            match max_lines.parse::<usize>() {
                Ok(n) if n >= 1 => target.max_lines = n,
                _ => warn!(
                    "Max lines '{}' for {} must be a positive number",
                    max_lines, target.key
                ),
            }
        }
        if let Some(cooldown) = self.get(annotations, "cooldown") {
            match cooldown.parse::<u64>() {
                Ok(secs) => target.cooldown = Duration::from_secs(secs),
                Err(_) => warn!(
                    "Cooldown '{}' for {} must be a non-negative number",
                    cooldown, target.key
                ),
            }
        }
        target
    }
}

/// Discovery state handed to every pod watcher.
#[derive(Clone)]
pub struct DiscoveryContext {
    pub manager: Arc<StreamManager>,
    pub config: Arc<Config>,
    pub annotations: Annotations,
    pub metrics: Arc<Metrics>,
}

/// One watcher per configured namespace, or a single cluster-wide watcher.
pub fn spawn_watchers(client: Client, ctx: DiscoveryContext) -> Vec<tokio::task::JoinHandle<()>> {
    let namespaces = ctx.config.kubernetes.namespaces.clone();
    let apis: Vec<(String, Api<Pod>)> = if namespaces.is_empty() {
        vec![("*".to_string(), Api::all(client))]
    } else {
        namespaces
            .into_iter()
            .map(|ns| {
                let api = Api::namespaced(client.clone(), &ns);
                (ns, api)
            })
            .collect()
    };

    apis.into_iter()
        .map(|(scope, api)| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    debug!("Starting pod watcher for namespace: {}", scope);
                    if let Err(err) = watch_pods(api.clone(), &ctx).await {
                        ctx.metrics.error();
                        error!("Pod watcher for {} stopped: {}, restarting", scope, err);
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            })
        })
        .collect()
}

async fn watch_pods(pods_api: Api<Pod>, ctx: &DiscoveryContext) -> anyhow::Result<()> {
    let mut stream = watcher(pods_api, WatcherConfig::default()).boxed();
    while let Some(event) = stream.try_next().await? {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                ctx.metrics.pod_event();
                handle_pod_event(&pod, ctx).await;
            }
            Event::Delete(pod) => {
                ctx.metrics.pod_event();
                let namespace = pod.namespace().unwrap_or_default();
                let name = pod.name_any();
                let stopped = ctx.manager.stop_pod(&namespace, &name).await;
                if stopped > 0 {
                    info!("POD DELETED: {}/{} | Stopped {} streams", namespace, name, stopped);
                }
            }
            Event::Init => info!("Initializing pod watcher"),
            Event::InitDone => info!("Pod watcher initialization complete"),
        }
    }
    Ok(())
}

/// Starts, restarts or stops the pod's container streams to match its current spec.
pub async fn handle_pod_event(pod: &Pod, ctx: &DiscoveryContext) {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    let annotations = pod.annotations();

    let wanted = phase == "Running"
        && pod.metadata.deletion_timestamp.is_none()
        && ctx.annotations.enabled(annotations)
        && ctx.annotations.labels_allowed(pod.labels(), annotations);

    if !wanted {
        let stopped = ctx.manager.stop_pod(&namespace, &name).await;
        if stopped > 0 {
            info!(
                "POD STATUS CHANGED: {}/{} | Phase: {} | Stopped {} streams",
                namespace, name, phase, stopped
            );
        }
        return;
    }

    let containers: Vec<String> = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    // Containers that disappeared from the spec.
    for key in ctx.manager.keys_for_pod(&namespace, &name).await {
        if !containers.contains(&key.container) {
            ctx.manager.stop(&key).await;
        }
    }

    for container in containers {
        let key = TargetKey::new(namespace.clone(), name.clone(), container);
        let target = ctx.annotations.target(key.clone(), annotations, &ctx.config);
        match ctx.manager.target(&key).await {
            Some(running) if *running == target => continue,
            Some(_) => {
                info!("Configuration changed for {}, restarting stream", key);
                ctx.manager.stop(&key).await;
            }
            None => info!("NEW STREAM: {} -> {}", key, target.channel),
        }
        ctx.manager.start(target).await;
    }
}
