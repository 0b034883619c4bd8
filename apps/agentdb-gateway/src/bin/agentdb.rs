#![allow(clippy::print_stdout, clippy::print_stderr, clippy::exit)]

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use agentdb_gateway::Gateway;
use agentdb_gateway::config::{Config, LogFormat};
use agentdb_gateway::db::redact_url;
use agentdb_gateway::policy::{DecisionRequest, GrantOperation, ScopeType};
use agentdb_gateway::schema::{compile_migration_plan, validate_schema_dsl};
use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use wallet_auth::{
    Eip191Signer, MutationRequest, SigningEnvelope, address_from_private_key,
    build_signing_message, normalize_address, sign_mutation, to_checksum_address,
};

#[derive(Parser)]
#[command(name = "agentdb")]
#[command(about = "Operator tooling for the policy-gated agent database gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a schema document and print its migration plan.
    Compile(CompileArgs),
    /// Print the exact message a wallet must sign for a mutation.
    CanonicalMessage(CanonicalMessageArgs),
    /// Sign a mutation request and print its auth envelope.
    Sign(SignArgs),
    /// Print the wallet address for a private key.
    Address(AddressArgs),
    /// Create the grant and migration metadata tables.
    InitDb,
    /// Evaluate policy for a wallet without performing the action.
    PreviewDecision(PreviewDecisionArgs),
}

#[derive(Args)]
struct CompileArgs {
    /// Schema document path, or `-` for stdin.
    #[arg(default_value = "-")]
    input: PathBuf,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct CanonicalMessageArgs {
    /// Mutation request JSON (requestId, tenantId, actorWallet, action, payload).
    #[arg(default_value = "-")]
    request: PathBuf,
    #[arg(long)]
    nonce: String,
    #[arg(long)]
    signed_at: String,
}

#[derive(Args)]
struct SignArgs {
    #[arg(default_value = "-")]
    request: PathBuf,
    /// Environment variable holding the hex private key.
    #[arg(long, default_value = "AGENTDB_PRIVATE_KEY")]
    private_key_env: String,
    /// Defaults to a fresh UUID.
    #[arg(long)]
    nonce: Option<String>,
    /// Defaults to the current time.
    #[arg(long)]
    signed_at: Option<String>,
}

#[derive(Args)]
struct AddressArgs {
    #[arg(long, default_value = "AGENTDB_PRIVATE_KEY")]
    private_key_env: String,
}

#[derive(Args)]
struct PreviewDecisionArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    wallet: String,
    #[arg(long, default_value = "database")]
    scope_type: String,
    #[arg(long, default_value = "*")]
    scope_id: String,
    #[arg(long)]
    operation: String,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Compile(args) => run_compile(&args),
        Commands::CanonicalMessage(args) => run_canonical_message(&args),
        Commands::Sign(args) => run_sign(&args),
        Commands::Address(args) => run_address(&args),
        Commands::InitDb => run_init_db().await,
        Commands::PreviewDecision(args) => run_preview_decision(args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn gateway_config() -> Result<Config> {
    let config = Config::from_env().context("invalid gateway configuration")?;
    init_tracing(config.log_format);
    Ok(config)
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        buffer
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_json(value: &impl Serialize, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}

fn read_private_key(env_name: &str) -> Result<String> {
    let key = std::env::var(env_name)
        .with_context(|| format!("{env_name} is not set"))?
        .trim()
        .to_string();
    if key.is_empty() {
        bail!("{env_name} is empty");
    }
    Ok(key)
}

fn run_compile(args: &CompileArgs) -> Result<()> {
    let document = read_json(&args.input)?;
    let dsl = match validate_schema_dsl(&document) {
        Ok(dsl) => dsl,
        Err(issues) => {
            print_json(&issues, true)?;
            bail!("schema document has {} validation issue(s)", issues.len());
        }
    };
    let plan = compile_migration_plan(&dsl)?;
    print_json(&plan, args.pretty)
}

fn run_canonical_message(args: &CanonicalMessageArgs) -> Result<()> {
    let request: MutationRequest =
        serde_json::from_value(read_json(&args.request)?).context("invalid mutation request")?;
    let actor_wallet = normalize_address(&request.actor_wallet)?;
    let message = build_signing_message(&SigningEnvelope {
        request_id: &request.request_id,
        tenant_id: &request.tenant_id,
        actor_wallet: &actor_wallet,
        action: &request.action,
        payload: &request.payload,
        nonce: args.nonce.trim(),
        signed_at: args.signed_at.trim(),
    })?;
    println!("{message}");
    Ok(())
}

fn run_sign(args: &SignArgs) -> Result<()> {
    let private_key = read_private_key(&args.private_key_env)?;
    let mut request: MutationRequest =
        serde_json::from_value(read_json(&args.request)?).context("invalid mutation request")?;
    let signer_address = address_from_private_key(&private_key)?;
    if request.actor_wallet.trim().is_empty() {
        request.actor_wallet = signer_address;
    } else if normalize_address(&request.actor_wallet)? != normalize_address(&signer_address)? {
        bail!("actorWallet does not match the signing key");
    }
    let nonce = args
        .nonce
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let signed_at = args
        .signed_at
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    let auth = sign_mutation(&Eip191Signer, &private_key, &request, &nonce, &signed_at)?;
    request.auth = Some(auth);
    print_json(&request, true)
}

fn run_address(args: &AddressArgs) -> Result<()> {
    let private_key = read_private_key(&args.private_key_env)?;
    let address = address_from_private_key(&private_key)?;
    println!("{}", to_checksum_address(&address)?);
    Ok(())
}

async fn run_init_db() -> Result<()> {
    let config = gateway_config()?;
    let url = config.db_url.clone().unwrap_or_default();
    let gateway = Gateway::from_config(config).await?;
    println!(
        "initialized {} metadata tables at {}",
        gateway.db().dialect(),
        redact_url(&url)
    );
    Ok(())
}

async fn run_preview_decision(args: PreviewDecisionArgs) -> Result<()> {
    let config = gateway_config()?;
    let gateway = Gateway::from_config(config).await?;
    let decision = gateway
        .grants()
        .preview_decision(&DecisionRequest {
            tenant_id: args.tenant,
            wallet_address: args.wallet,
            scope_type: ScopeType::parse(&args.scope_type)?,
            scope_id: args.scope_id,
            operation: GrantOperation::parse(&args.operation)?,
        })
        .await?;
    print_json(&decision, true)
}
