use std::time::Duration;

use clap::Parser;
use duration_string::DurationString;
use kube::runtime::watcher;

use crate::derived::ExposurePolicy;

/// Controller settings. Every flag can also be set through its `EKSPOSE_*`
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Expose Deployments through derived Services and Ingresses", long_about = None)]
pub struct Config {
    /// Only watch Deployments in this namespace (all namespaces when unset)
    #[arg(long, env = "EKSPOSE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Only expose Deployments matching this label selector
    #[arg(long, env = "EKSPOSE_LABEL_SELECTOR")]
    pub label_selector: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "EKSPOSE_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Period of the full resync; 0s disables it.
    ///
    /// A write that loses a race against another client is not retried; the
    /// next resync repairs it. With resync disabled such an object stays stale
    /// until its Deployment changes again.
    #[arg(long, env = "EKSPOSE_RESYNC_PERIOD", default_value = "10m")]
    pub resync_period: DurationString,

    /// A reconcile running longer than this counts as failed
    #[arg(long, env = "EKSPOSE_RECONCILE_TIMEOUT", default_value = "30s")]
    pub reconcile_timeout: DurationString,

    /// Give up when the Deployment cache has not synced by then
    #[arg(long, env = "EKSPOSE_CACHE_SYNC_TIMEOUT", default_value = "120s")]
    pub cache_sync_timeout: DurationString,

    /// First retry delay after a failed reconcile
    #[arg(long, env = "EKSPOSE_BACKOFF_BASE", default_value = "5ms")]
    pub backoff_base: DurationString,

    /// Upper bound of the retry delay
    #[arg(long, env = "EKSPOSE_BACKOFF_MAX", default_value = "1000s")]
    pub backoff_max: DurationString,

    /// Port exposed by derived Services
    #[arg(long, env = "EKSPOSE_PORT", default_value_t = 80)]
    pub port: i32,

    /// Name of the exposed Service port
    #[arg(long, env = "EKSPOSE_PORT_NAME", default_value = "http")]
    pub port_name: String,

    /// Also derive an Ingress for every Deployment
    #[arg(long, env = "EKSPOSE_MANAGE_INGRESS")]
    pub manage_ingress: bool,

    /// ingressClassName of derived Ingresses
    #[arg(long, env = "EKSPOSE_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    /// Address of the health and diagnostics endpoint
    #[arg(long, env = "EKSPOSE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            workers: 2,
            resync_period: DurationString::new(Duration::from_secs(10 * 60)),
            reconcile_timeout: DurationString::new(Duration::from_secs(30)),
            cache_sync_timeout: DurationString::new(Duration::from_secs(120)),
            backoff_base: DurationString::new(Duration::from_millis(5)),
            backoff_max: DurationString::new(Duration::from_secs(1000)),
            port: 80,
            port_name: "http".to_string(),
            manage_ingress: false,
            ingress_class: None,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    pub fn policy(&self) -> ExposurePolicy {
        ExposurePolicy {
            port: self.port,
            port_name: self.port_name.clone(),
            ingress_class: self.ingress_class.clone(),
        }
    }

    pub fn watcher_config(&self) -> watcher::Config {
        let config = watcher::Config::default().any_semantic();
        match &self.label_selector {
            Some(selector) => config.labels(selector),
            None => config,
        }
    }

    /// Without resync, drift left by a lost write race is only repaired on
    /// the next change of the Deployment.
    pub fn resync_disabled(&self) -> bool {
        Duration::from(self.resync_period).is_zero()
    }

    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_defaults_match_default() {
        let parsed = Config::try_parse_from(["ekspose"]).unwrap();
        let default = Config::default();
        assert_eq!(parsed.workers, default.workers);
        assert_eq!(parsed.policy(), default.policy());
        assert_eq!(
            Duration::from(parsed.resync_period),
            Duration::from(default.resync_period)
        );
        assert_eq!(
            Duration::from(parsed.backoff_base),
            Duration::from(default.backoff_base)
        );
        assert_eq!(
            Duration::from(parsed.backoff_max),
            Duration::from(default.backoff_max)
        );
        assert!(!parsed.manage_ingress);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::try_parse_from([
            "ekspose",
            "--workers",
            "0",
            "--resync-period",
            "30s",
            "--manage-ingress",
            "--ingress-class",
            "nginx",
            "--port",
            "8000",
            "--label-selector",
            "expose=true",
        ])
        .unwrap();
        assert_eq!(cfg.workers(), 1);
        assert_eq!(Duration::from(cfg.resync_period), Duration::from_secs(30));
        assert!(cfg.manage_ingress);
        let policy = cfg.policy();
        assert_eq!(policy.port, 8000);
        assert_eq!(policy.ingress_class.as_deref(), Some("nginx"));
        assert_eq!(
            cfg.watcher_config().label_selector.as_deref(),
            Some("expose=true")
        );
    }

    #[test]
    fn zero_resync_period_disables_resync() {
        let cfg = Config::try_parse_from(["ekspose", "--resync-period", "0s"]).unwrap();
        assert!(cfg.resync_disabled());
        assert!(!Config::default().resync_disabled());
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(Config::try_parse_from(["ekspose", "--reconcile-timeout", "soon"]).is_err());
    }
}
