mod workspace;

use anyhow::{bail, Context};
use canary_adapters::{
    CodexBackend, IpfsBackend, LedgerGatedCipher, LocalDirBackend, PinataBackend, StaticIdentity,
};
use canary_core::{
    Address, CanaryConfig, CanaryError, CancelHandle, CancelSignal, CheckInReport, Clock,
    Collaborators, CreateDossierRequest, DossierId, DossierLifecycleService, DossierRef,
    DossierStatus, IdentityProvider, ItemOutcome, PayloadFile, Severity, StorageBackend,
    SystemClock, TerminalAck, TerminalAction,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use workspace::Workspace;

#[derive(Debug, Parser)]
#[command(name = "canary", version, about = "Dead-man's switch for encrypted dossiers")]
struct Cli {
    /// JSON configuration file; defaults apply when absent.
    #[arg(long, global = true, default_value = "canary.json", env = "CANARY_CONFIG")]
    config: PathBuf,
    /// Directory holding the local ledger and placeholder storage.
    #[arg(long, global = true, default_value = ".canary", env = "CANARY_DATA_DIR")]
    data_dir: PathBuf,
    /// Address acting as the caller, e.g. 0xab...ab
    #[arg(long, global = true, env = "CANARY_IDENTITY")]
    identity: Option<String>,
    /// Secret the payload cipher keys are derived from.
    #[arg(long, global = true, env = "CANARY_CIPHER_SECRET", hide_env_values = true)]
    cipher_secret: Option<String>,
    /// Codex node base url, e.g. http://localhost:8080
    #[arg(long, global = true, env = "CODEX_NODE_URL")]
    codex_url: Option<String>,
    /// Pinata JWT; enables the Pinata backend.
    #[arg(long, global = true, env = "PINATA_JWT", hide_env_values = true)]
    pinata_jwt: Option<String>,
    /// Gateway used to fetch pinned content.
    #[arg(long, global = true, env = "PINATA_GATEWAY")]
    pinata_gateway: Option<String>,
    /// IPFS node RPC url, e.g. http://127.0.0.1:5001
    #[arg(long, global = true, env = "IPFS_API_URL")]
    ipfs_api: Option<String>,
    /// Print machine-readable JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Encrypt files and register a new dossier.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Check-in interval: seconds or a 30m / 12h / 7d style value.
        #[arg(long, value_parser = parse_interval)]
        interval: Duration,
        #[arg(long = "recipient", required = true)]
        recipients: Vec<String>,
        #[arg(long = "guardian")]
        guardians: Vec<String>,
        #[arg(long, default_value_t = 0)]
        threshold: u32,
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Check in every active dossier, or one with --id.
    CheckIn {
        #[arg(long)]
        id: Option<u64>,
    },
    /// Show one dossier, or all dossiers of an owner.
    Status {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        id: Option<u64>,
    },
    Pause {
        #[arg(long)]
        id: u64,
    },
    Resume {
        #[arg(long)]
        id: u64,
    },
    AddFiles {
        #[arg(long)]
        id: u64,
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    UpdateInterval {
        #[arg(long)]
        id: u64,
        #[arg(long, value_parser = parse_interval)]
        interval: Duration,
    },
    /// Release immediately. Irreversible.
    ReleaseNow {
        #[arg(long)]
        id: u64,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Prevent release forever. Irreversible.
    Disable {
        #[arg(long)]
        id: u64,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Confirm release of a dossier you guard.
    Confirm {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        id: u64,
    },
    /// List dossiers naming the caller as a guardian.
    Guarding,
    /// List public dossiers, from every owner, that are open to read.
    Feed,
    /// Decrypt a released dossier into a directory.
    Decrypt {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        id: u64,
        #[arg(long, default_value = "decrypted")]
        out: PathBuf,
    },
}

/// Parse `90`, `90s`, `15m`, `12h` or `7d` into a duration.
fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((split, _)) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{}' is not a duration", raw))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };
    value
        .checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("'{}' is too large", raw))
}

fn parse_address(raw: &str) -> anyhow::Result<Address> {
    Ok(Address::parse(raw)?)
}

fn read_payloads(paths: &[PathBuf]) -> anyhow::Result<Vec<PayloadFile>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(PayloadFile::new(name, bytes))
        })
        .collect()
}

fn storage_backends(
    cli: &Cli,
    config: &CanaryConfig,
    ws: &Workspace,
) -> anyhow::Result<Vec<Arc<dyn StorageBackend>>> {
    let timeout = config.timeouts.storage_upload();
    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
    if let Some(url) = &cli.codex_url {
        backends.push(Arc::new(CodexBackend::new(url, timeout)?));
    }
    if let Some(jwt) = &cli.pinata_jwt {
        backends.push(Arc::new(PinataBackend::new(
            jwt.clone(),
            cli.pinata_gateway.as_deref(),
            timeout,
        )?));
    }
    if let Some(url) = &cli.ipfs_api {
        backends.push(Arc::new(IpfsBackend::new(url, timeout)?));
    }
    if backends.is_empty() {
        warn!(
            "no durable storage configured; payloads will only be kept in {}",
            ws.objects_dir().display()
        );
    }
    backends.push(Arc::new(LocalDirBackend::new(ws.objects_dir())));
    Ok(backends)
}

fn build_service(
    cli: &Cli,
    config: CanaryConfig,
    ws: &Workspace,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(DossierLifecycleService, Arc<StaticIdentity>)> {
    let identity = cli
        .identity
        .as_deref()
        .context("--identity (or CANARY_IDENTITY) is required")?;
    let identity = Arc::new(StaticIdentity::new(parse_address(identity)?));
    let secret = cli
        .cipher_secret
        .as_deref()
        .context("--cipher-secret (or CANARY_CIPHER_SECRET) is required")?;

    let cipher = LedgerGatedCipher::new(
        secret.as_bytes(),
        ws.ledger(),
        clock.clone(),
        config.timeouts.clone(),
    )?;
    let service = DossierLifecycleService::new(
        Collaborators {
            ledger: ws.ledger(),
            storage: storage_backends(cli, &config, ws)?,
            cipher: Arc::new(cipher),
            identity: identity.clone(),
            clock,
        },
        config,
    )?;
    Ok((service, identity))
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_status(status: &DossierStatus) {
    println!(
        "{}  {:<24} {:<10} phase={:?} remaining={}s files={} mode={}",
        status.dossier,
        status.name,
        status.state.label(),
        status.phase,
        status.remaining_secs,
        status.file_count,
        status.release_mode
    );
    if let Some(quorum) = &status.quorum {
        println!(
            "    guardians: {}/{} confirmations",
            quorum.confirmations, quorum.threshold
        );
    }
}

fn print_report(report: &CheckInReport) {
    println!("check-in {} ({:?})", report.trace_id, report.mode);
    for (id, outcome) in &report.outcomes {
        match outcome {
            ItemOutcome::CheckedIn { at } => println!("  #{} checked in at {}", id, at),
            ItemOutcome::AlreadyCurrent => println!("  #{} already current", id),
            ItemOutcome::Skipped { reason } => println!("  #{} skipped: {}", id, reason),
            ItemOutcome::Failed { reason, .. } => println!("  #{} FAILED: {}", id, reason),
            ItemOutcome::NotAttempted => println!("  #{} not attempted", id),
        }
    }
    for finding in &report.findings {
        println!("  finding: #{} {:?}", finding.id, finding.kind);
    }
}

fn confirm_terminal(action: TerminalAction, yes: bool) -> anyhow::Result<TerminalAck> {
    eprintln!("WARNING: {}", action.warning());
    if !yes {
        bail!("refusing without --yes");
    }
    Ok(TerminalAck::acknowledge(action))
}

fn write_outputs(out: &Path, files: &[canary_core::DecryptedFile]) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out)?;
    let mut taken = HashSet::new();
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let path = out.join(unique_output_name(&mut taken, &file.entry.name));
        std::fs::write(&path, &file.bytes).with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

/// Base name of `name`, suffixed `-2`, `-3`, ... until unused in this batch.
fn unique_output_name(taken: &mut HashSet<String>, name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    if taken.insert(base.clone()) {
        return base;
    }
    let path = Path::new(&base);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base.clone());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 2;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

async fn run(
    cli: &Cli,
    service: &DossierLifecycleService,
    cancel: &CancelSignal,
) -> anyhow::Result<()> {
    let json = cli.json;
    let progress = |loaded: u64, total: u64| {
        tracing::debug!(loaded, total, "upload progress");
    };

    match &cli.command {
        Command::Create {
            name,
            description,
            interval,
            recipients,
            guardians,
            threshold,
            files,
        } => {
            let request = CreateDossierRequest {
                name: name.clone(),
                description: description.clone(),
                check_in_interval: *interval,
                recipients: recipients.clone(),
                guardians: guardians.clone(),
                guardian_threshold: *threshold,
                files: read_payloads(files)?,
            };
            let created = service.create_dossier(request, &progress, cancel).await?;
            emit(json, &created, |c| {
                println!("created dossier {} (manifest {})", c.dossier, c.manifest.locator);
                for warning in &c.warnings {
                    println!("  warning: {}", warning);
                }
            })
        }
        Command::CheckIn { id: Some(id) } => {
            let outcome = service.check_in_one(DossierId(*id), cancel).await?;
            emit(json, &outcome, |o| println!("#{}: {:?}", id, o))
        }
        Command::CheckIn { id: None } => {
            let report = service.check_in(cancel).await?;
            emit(json, &report, print_report)?;
            if !report.is_complete() {
                bail!("check-in incomplete: {} dossier(s) failed", report.failed().len());
            }
            Ok(())
        }
        Command::Status { owner, id } => {
            let owner = match owner {
                Some(raw) => parse_address(raw)?,
                None => service.caller(),
            };
            let statuses = match id {
                Some(id) => vec![service.status(&DossierRef::new(owner, DossierId(*id))).await?],
                None => service.list_dossiers(&owner).await?,
            };
            emit(json, &statuses, |all| {
                if all.is_empty() {
                    println!("no dossiers");
                }
                all.iter().for_each(print_status);
            })
        }
        Command::Pause { id } => {
            let outcome = service.pause(DossierId(*id), cancel).await?;
            emit(json, &outcome, |o| println!("pause #{}: {:?}", id, o))
        }
        Command::Resume { id } => {
            let outcome = service.resume(DossierId(*id), cancel).await?;
            emit(json, &outcome, |o| println!("resume #{}: {:?}", id, o))
        }
        Command::AddFiles { id, files } => {
            let commits = service
                .add_files(DossierId(*id), read_payloads(files)?, &progress, cancel)
                .await?;
            emit(json, &commits, |all| {
                for c in all {
                    println!("added {} via {}", c.locator, c.provider);
                }
            })
        }
        Command::UpdateInterval { id, interval } => {
            let outcome = service.update_interval(DossierId(*id), *interval, cancel).await?;
            emit(json, &outcome, |o| println!("interval #{}: {:?}", id, o))
        }
        Command::ReleaseNow { id, yes } => {
            let ack = confirm_terminal(TerminalAction::ReleaseNow, *yes)?;
            let outcome = service.release_now(DossierId(*id), ack, cancel).await?;
            emit(json, &outcome, |o| println!("release #{}: {:?}", id, o))
        }
        Command::Disable { id, yes } => {
            let ack = confirm_terminal(TerminalAction::PermanentlyDisable, *yes)?;
            let outcome = service.permanently_disable(DossierId(*id), ack, cancel).await?;
            emit(json, &outcome, |o| println!("disable #{}: {:?}", id, o))
        }
        Command::Confirm { owner, id } => {
            let dossier = DossierRef::new(parse_address(owner)?, DossierId(*id));
            let outcome = service.confirm_release(&dossier, cancel).await?;
            emit(json, &outcome, |o| println!("confirm {}: {:?}", dossier, o))
        }
        Command::Guarding => {
            let assignments = service.dossiers_guarded_by(&service.caller()).await?;
            emit(json, &assignments, |all| {
                for a in all {
                    println!(
                        "{}  {:<24} phase={:?} confirmed={} ({}/{})",
                        a.dossier, a.name, a.phase, a.has_confirmed, a.confirmations, a.threshold
                    );
                }
            })
        }
        Command::Feed => {
            let feed = service.released_public().await?;
            emit(json, &feed, |all| {
                if all.is_empty() {
                    println!("no public releases");
                }
                all.iter().for_each(print_status);
            })
        }
        Command::Decrypt { owner, id, out } => {
            let dossier = DossierRef::new(parse_address(owner)?, DossierId(*id));
            let opened = service.decrypt(&dossier, &service.evidence()).await?;
            let written = write_outputs(out, &opened.files)?;
            emit(json, &written, |paths| {
                for path in paths {
                    println!("wrote {}", path.display());
                }
            })
        }
    }
}

fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<CanaryError>() {
        Some(e) => match e.class().severity() {
            Severity::Quiet => info!(class = ?e.class(), "{}", e),
            Severity::Actionable => warn!(class = ?e.class(), "{}", e),
            Severity::Loud => error!(class = ?e.class(), "{}", e),
        },
        None => error!("{:#}", err),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "canary=info,info".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CanaryConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ws = Workspace::open(&cli.data_dir, clock.clone(), config.limits.clone())?;
    let (service, identity) = build_service(&cli, config, &ws, clock)?;
    info!(caller = %identity.address(), data_dir = %ws.root().display(), "canary ready");

    let (handle, cancel) = CancelHandle::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });

    let result = run(&cli, &service, &cancel).await;
    ws.persist().await?;
    if let Err(err) = &result {
        report_failure(err);
    }
    result
}
