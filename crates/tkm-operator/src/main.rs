//! TKM Operator - digest pinning and GPU compatibility for kernel caches

mod controller_runner;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use tkm_common::telemetry::{init_telemetry, TelemetryConfig};
use tkm_common::{ResourceRegistry, FIELD_MANAGER};
use tkm_node_status::{GpuInfo, HardwareProbe, StaticProbe};
use tkm_webhook::{
    webhook_router, AdmissionConfig, CacheMutator, CosignVerifier, RegistryConfig,
    RegistryResolver, SignerIdentity, WebhookState,
};

use controller_runner::{build_cache_controllers, build_node_status_controller};

/// TKM - Kubernetes operator for GPU kernel caches
#[derive(Parser, Debug)]
#[command(name = "tkm-operator", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every CRD as multi-document YAML and exit
    Crd,
    /// Run the admission webhook and controllers (default mode)
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Address the admission webhook listens on
    #[arg(long, env = "TKM_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// PEM certificate served by the webhook
    #[arg(long, env = "TKM_TLS_CERT", default_value = "/etc/tkm/tls/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key for the webhook certificate
    #[arg(long, env = "TKM_TLS_KEY", default_value = "/etc/tkm/tls/tls.key")]
    tls_key: PathBuf,

    /// Admission deadline covering digest lookup and signature verification
    #[arg(long, env = "TKM_REGISTRY_TIMEOUT_SECS", default_value_t = 8)]
    registry_timeout_secs: u64,

    /// Registry reached over plain HTTP (repeatable)
    #[arg(
        long = "insecure-registry",
        env = "TKM_INSECURE_REGISTRIES",
        value_delimiter = ','
    )]
    insecure_registries: Vec<String>,

    /// GPU type reported by the node probe
    #[arg(long, env = "TKM_PROBE_GPU_TYPE", default_value = tkm_node_status::probe::DEFAULT_GPU_TYPE)]
    probe_gpu_type: String,

    /// Driver version reported by the node probe
    #[arg(long, env = "TKM_PROBE_DRIVER_VERSION", default_value = tkm_node_status::probe::DEFAULT_DRIVER_VERSION)]
    probe_driver_version: String,

    /// Required certificate subject of cache image signers
    #[arg(long, env = "TKM_SIGNER_IDENTITY")]
    signer_identity: Option<String>,

    /// Required OIDC issuer of cache image signers
    #[arg(long, env = "TKM_SIGNER_ISSUER")]
    signer_issuer: Option<String>,

    /// Do not install or update CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,
}

impl RunArgs {
    fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook, kube client, and registry client all share this provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let registry = ResourceRegistry::new();

    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Crd => {
            print!("{}", render_crds(&registry)?);
            Ok(())
        }
        Commands::Run(args) => {
            init_telemetry(TelemetryConfig::default())?;
            run(args, Arc::new(registry)).await
        }
    }
}

/// Render every registered CRD as one multi-document YAML stream
fn render_crds(registry: &ResourceRegistry) -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in registry.crds() {
        let doc = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}

/// Ensure all TKM CRDs are installed
///
/// Server-side apply keeps the installed schemas in step with this binary.
async fn ensure_crds_installed(client: &Client, registry: &ResourceRegistry) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for kind in registry.kinds() {
        let crd = kind.crd();
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{} CRD has no name", kind.kind))?;

        tracing::info!(crd = %name, "Installing {} CRD...", kind.kind);
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", kind.kind, e))?;
    }

    tracing::info!("All TKM CRDs installed/updated");
    Ok(())
}

fn build_mutator(args: &RunArgs) -> CacheMutator {
    let resolver = RegistryResolver::new(RegistryConfig {
        timeout: args.registry_timeout(),
        insecure_registries: args.insecure_registries.clone(),
    });

    let verifier = CosignVerifier::new(
        SignerIdentity {
            identity: args.signer_identity.clone(),
            issuer: args.signer_issuer.clone(),
        },
        args.insecure_registries.clone(),
    );

    CacheMutator::new(
        Arc::new(resolver),
        Arc::new(verifier),
        AdmissionConfig {
            timeout: args.registry_timeout(),
        },
    )
}

async fn serve_webhook(args: RunArgs, registry: Arc<ResourceRegistry>) -> anyhow::Result<()> {
    let state = Arc::new(WebhookState::new(registry, build_mutator(&args)));

    let tls_config = RustlsConfig::from_pem_file(&args.tls_cert, &args.tls_key)
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;

    tracing::info!(addr = %args.webhook_addr, "Starting admission webhook");

    axum_server::bind_rustls(args.webhook_addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))
}

async fn run(args: RunArgs, registry: Arc<ResourceRegistry>) -> anyhow::Result<()> {
    tracing::info!("TKM operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client, &registry).await?;
    }

    let probe: Arc<dyn HardwareProbe> = Arc::new(StaticProbe::new(GpuInfo::new(
        args.probe_gpu_type.clone(),
        args.probe_driver_version.clone(),
    )));

    tracing::info!("Starting controllers:");
    let mut controllers = build_cache_controllers(client.clone());
    controllers.push(build_node_status_controller(client, probe));

    tokio::select! {
        result = serve_webhook(args, registry) => {
            result?;
            tracing::info!("Webhook server completed");
        }
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers completed");
        }
    }

    tracing::info!("TKM operator shutting down");
    Ok(())
}
