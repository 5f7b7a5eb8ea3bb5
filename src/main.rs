//! trustroot - keeps a cluster-internal webhook trust root valid and distributed

use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use trustroot::config::TrustConfig;
use trustroot::controller::{error_policy, reconcile, trigger_ref, Context};
use trustroot::leader::{LeaderElector, DEFAULT_LEASE_NAME};
use trustroot::retry::RetryConfig;
use trustroot::telemetry::{init_telemetry, TelemetryConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

const HOUR: u64 = 3600;

/// Certificate lifecycle controller for the operator's webhook trust root
#[derive(Parser, Debug)]
#[command(name = "trustroot", version, about, long_about = None)]
struct Cli {
    /// Namespace of the trust secret and the webhook service
    #[arg(long, env = "TRUSTROOT_NAMESPACE", default_value = "trustroot-system")]
    namespace: String,

    /// Name of the trust secret
    #[arg(long, env = "TRUSTROOT_SECRET_NAME", default_value = "trustroot-tls")]
    secret_name: String,

    /// Generate and rotate certificates; when false the secret is managed externally
    #[arg(
        long,
        env = "TRUSTROOT_GENERATE_CERTIFICATES",
        default_value_t = true,
        action = ArgAction::Set
    )]
    generate_certificates: bool,

    /// ValidatingWebhookConfiguration to keep in sync
    #[arg(
        long,
        env = "TRUSTROOT_VALIDATING_WEBHOOK_CONFIGURATION",
        default_value = "trustroot-validating-webhook-configuration"
    )]
    validating_webhook_configuration: String,

    /// MutatingWebhookConfiguration to keep in sync
    #[arg(
        long,
        env = "TRUSTROOT_MUTATING_WEBHOOK_CONFIGURATION",
        default_value = "trustroot-mutating-webhook-configuration"
    )]
    mutating_webhook_configuration: String,

    /// CustomResourceDefinition whose conversion webhook is managed
    #[arg(long, env = "TRUSTROOT_CRD_NAME", default_value = "tenants.trustroot.dev")]
    crd_name: String,

    /// Service fronting the webhook server
    #[arg(
        long,
        env = "TRUSTROOT_SERVICE_NAME",
        default_value = "trustroot-webhook-service"
    )]
    service_name: String,

    /// Path of the conversion endpoint
    #[arg(long, env = "TRUSTROOT_CONVERSION_PATH", default_value = "/convert")]
    conversion_path: String,

    /// Port of the webhook service
    #[arg(long, env = "TRUSTROOT_SERVICE_PORT", default_value_t = 443)]
    service_port: i32,

    /// ConversionReview versions served by the conversion endpoint
    #[arg(
        long,
        env = "TRUSTROOT_CONVERSION_REVIEW_VERSIONS",
        value_delimiter = ',',
        default_value = "v1alpha1,v1beta1"
    )]
    conversion_review_versions: Vec<String>,

    /// Regenerate when the leaf has fewer hours than this left
    #[arg(long, env = "TRUSTROOT_EXPIRATION_THRESHOLD_HOURS", default_value_t = 72)]
    expiration_threshold_hours: u64,

    /// Schedule the next pass this many hours before the leaf expires
    #[arg(
        long,
        env = "TRUSTROOT_RECONCILIATION_LOOKAHEAD_HOURS",
        default_value_t = 96
    )]
    reconciliation_lookahead_hours: u64,

    /// Validity of newly issued leaf certificates, in hours
    #[arg(long, env = "TRUSTROOT_CERTIFICATE_VALIDITY_HOURS", default_value_t = 4320)]
    certificate_validity_hours: u64,

    /// Fail the pass when the sibling pods cannot be discovered
    #[arg(long, env = "TRUSTROOT_REQUIRE_FLEET")]
    require_fleet: bool,

    /// Attempts per resource update before a conflict fails the pass
    #[arg(long, env = "TRUSTROOT_CONFLICT_RETRIES", default_value_t = 5)]
    conflict_retries: u32,

    /// Namespace of the pod running this controller (defaults to --namespace)
    #[arg(long, env = "POD_NAMESPACE")]
    pod_namespace: Option<String>,

    /// Name of the pod running this controller
    #[arg(long, env = "HOSTNAME", default_value = "")]
    pod_name: String,

    /// Run the controller only while holding the leader lease
    #[arg(
        long,
        env = "TRUSTROOT_LEADER_ELECTION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    leader_election: bool,

    /// Lease used for leader election, in the pod namespace
    #[arg(long, env = "TRUSTROOT_LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    lease_name: String,

    /// Emit JSON log lines
    #[arg(long, env = "TRUSTROOT_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn trust_config(&self) -> TrustConfig {
        TrustConfig {
            namespace: self.namespace.clone(),
            secret_name: self.secret_name.clone(),
            generate_certificates: self.generate_certificates,
            validating_webhook_configuration: self.validating_webhook_configuration.clone(),
            mutating_webhook_configuration: self.mutating_webhook_configuration.clone(),
            crd_name: self.crd_name.clone(),
            service_name: self.service_name.clone(),
            conversion_path: self.conversion_path.clone(),
            service_port: self.service_port,
            conversion_review_versions: self.conversion_review_versions.clone(),
            expiration_threshold: Duration::from_secs(self.expiration_threshold_hours * HOUR),
            reconciliation_lookahead: Duration::from_secs(
                self.reconciliation_lookahead_hours * HOUR,
            ),
            certificate_validity: Duration::from_secs(self.certificate_validity_hours * HOUR),
            require_fleet: self.require_fleet,
            retry: RetryConfig::with_max_attempts(self.conflict_retries),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = cli.trust_config();
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let pod_namespace = cli
        .pod_namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| config.namespace.clone());

    let ctx = Arc::new(
        Context::builder(client.clone(), config)
            .fleet_pod(pod_namespace.clone(), cli.pod_name.clone())
            .build(),
    );

    if !cli.leader_election {
        run_controller(client, ctx).await;
        return Ok(());
    }

    if cli.pod_name.is_empty() {
        anyhow::bail!("leader election needs the pod name (--pod-name or HOSTNAME)");
    }

    let elector = Arc::new(LeaderElector::new(
        ctx.kube.clone(),
        &cli.lease_name,
        &pod_namespace,
        &cli.pod_name,
    ));
    let mut guard = elector.acquire().await;

    let lost = tokio::select! {
        _ = run_controller(client, ctx) => false,
        _ = guard.lost() => true,
    };
    if lost {
        // Another replica may already be reconciling; stop instead of racing it
        anyhow::bail!("leadership lost");
    }

    if let Err(e) = guard.release_leadership().await {
        tracing::warn!(error = %e, "Failed to release leader lease");
    }
    Ok(())
}

/// Watch the trust root and its consumers until a shutdown signal arrives
///
/// The controller is keyed on the managed CRD. Events on the trust secret and
/// both admission configurations map onto it, so a deleted secret is recreated
/// and an edited webhook configuration gets its CA bundle back on the next pass.
async fn run_controller(client: Client, ctx: Arc<Context>) {
    let config = &ctx.config;
    let trigger = trigger_ref(config);

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let vwcs: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let mwcs: Api<MutatingWebhookConfiguration> = Api::all(client);

    let by_name = |name: &str| {
        WatcherConfig::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(WATCH_TIMEOUT_SECS)
    };

    tracing::info!(
        secret = %ctx.trust_root(),
        trigger = %trigger,
        generate = config.generate_certificates,
        "Starting trust root controller"
    );

    Controller::new(crds, by_name(&config.crd_name))
        .watches(secrets, by_name(&config.secret_name), {
            let trigger = trigger.clone();
            move |_: Secret| Some(trigger.clone())
        })
        .watches(vwcs, by_name(&config.validating_webhook_configuration), {
            let trigger = trigger.clone();
            move |_: ValidatingWebhookConfiguration| Some(trigger.clone())
        })
        .watches(mwcs, by_name(&config.mutating_webhook_configuration), {
            let trigger = trigger.clone();
            move |_: MutatingWebhookConfiguration| Some(trigger.clone())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("TrustRoot"))
        .await;

    tracing::info!("Trust root controller stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
