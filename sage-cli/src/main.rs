//! Sage - Agent Detection & Response hook for AI coding assistants.
//!
//! The `hook` subcommand is the hot path: one tool-call payload on
//! stdin, one line of JSON on stdout, exit code always 0. Everything
//! that can go wrong degrades to an allow response; the hook must never
//! crash the host agent.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use sage_core::engine::{EvalRequest, Evaluator, SagePaths};
use sage_core::harness::{self, response};
use sage_core::plugin_scan::{PluginInfo, PluginScanner};
use sage_core::state;
use sage_core::store::approvals::{action_id, ApprovalStore, PendingApproval};
use sage_core::store::Allowlist;
use sage_core::{Config, Decision, Sensitivity, Verdict};

/// Which host response shape to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HarnessKind {
    /// Claude Code hookSpecificOutput shape.
    Claude,
    /// Cursor preToolUse decision shape.
    Cursor,
    /// Cursor before-event permission shape.
    CursorBefore,
    /// In-process agent block/blockReason shape.
    Agent,
}

#[derive(Parser, Debug)]
#[clap(name = "sage", about = "Agent Detection & Response for AI coding assistants", version)]
struct Cli {
    /// Override the state directory (default ~/.sage).
    #[clap(long, global = true)]
    state_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one tool call from stdin and print the host response.
    Hook {
        /// Host response shape.
        #[clap(long, value_enum, default_value = "claude")]
        harness: HarnessKind,
    },

    /// Consume a pending approval recorded by an earlier ask verdict.
    Approve {
        /// Session the pending approval belongs to.
        #[clap(long)]
        session: String,
        /// Tool-use id (or action id) of the pending approval.
        #[clap(long)]
        id: String,
        /// Also add the approved artifacts to the allowlist.
        #[clap(long)]
        allowlist: bool,
    },

    /// Manage the per-artifact-type allowlist.
    Allowlist {
        #[clap(subcommand)]
        action: AllowlistAction,
    },

    /// Scan installed host plugins for threats.
    ScanPlugins {
        /// Treat a single directory as one plugin root instead of
        /// reading a plugin list from stdin.
        #[clap(long)]
        dir: Option<PathBuf>,
        /// Plugin key used with --dir.
        #[clap(long, default_value = "local-plugin")]
        key: String,
    },
}

#[derive(Subcommand, Debug)]
enum AllowlistAction {
    AddUrl { url: String, #[clap(long, default_value = "added manually")] reason: String },
    AddCommand { command: String, #[clap(long, default_value = "added manually")] reason: String },
    AddPath { path: String, #[clap(long, default_value = "added manually")] reason: String },
    RemoveUrl { url: String },
    RemoveCommand { command: String },
    RemovePath { path: String },
}

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr; stdout is a pure JSON channel.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let paths = cli
        .state_dir
        .clone()
        .map(SagePaths::new)
        .unwrap_or_default();

    match cli.command {
        Command::Hook { harness } => {
            // The hook path never fails: any error prints an allow
            // response and the process still exits 0.
            let output = run_hook(&paths, harness).await.unwrap_or_else(|e| {
                warn!("Hook failed open: {e:#}");
                allow_shape(harness)
            });
            println!("{output}");
        }
        Command::Approve {
            session,
            id,
            allowlist,
        } => {
            if let Err(e) = run_approve(&paths, &session, &id, allowlist) {
                eprintln!("approve failed: {e:#}");
                std::process::exit(1);
            }
        }
        Command::Allowlist { action } => {
            if let Err(e) = run_allowlist(&paths, action) {
                eprintln!("allowlist operation failed: {e:#}");
                std::process::exit(1);
            }
        }
        Command::ScanPlugins { dir, key } => {
            if let Err(e) = run_scan_plugins(&paths, dir, key).await {
                eprintln!("plugin scan failed: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

/// The silent-allow response for each harness shape.
fn allow_shape(harness: HarnessKind) -> String {
    let verdict = Verdict::allow("error");
    let value = match harness {
        HarnessKind::Claude => response::claude_response(&verdict),
        HarnessKind::Cursor => response::cursor_pre_tool_use_response(&verdict),
        HarnessKind::CursorBefore => response::cursor_before_event_response(&verdict),
        HarnessKind::Agent => response::agent_response(&verdict, ""),
    };
    value.to_string()
}

async fn run_hook(paths: &SagePaths, harness: HarnessKind) -> Result<String> {
    // Clean up after any crashed prior invocation.
    state::prune_stale_tmp_files(&paths.state_dir);
    let config = Config::load(&paths.config_path());
    let approvals = ApprovalStore::new(&paths.state_dir)
        .with_paranoid(config.sensitivity == Sensitivity::Paranoid);
    approvals.prune_stale_files();

    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("Failed to read stdin")?;
    let text = harness::decode_hook_input(&raw)?;
    let request = harness::parse_hook_request(&text)?;

    let evaluator = Evaluator::new(paths.clone());
    let mut verdict = evaluator.evaluate(&request).await;

    let call_action_id = action_id(&request.tool_name, &request.tool_input);

    if verdict.decision == Decision::Ask {
        if let Some(approved) = apply_approvals(&approvals, &request) {
            verdict = approved;
        } else {
            record_pending(&approvals, &request, &verdict, &call_action_id);
        }
    }

    let value = match harness {
        HarnessKind::Claude => response::claude_response(&verdict),
        HarnessKind::Cursor => response::cursor_pre_tool_use_response(&verdict),
        HarnessKind::CursorBefore => response::cursor_before_event_response(&verdict),
        HarnessKind::Agent => response::agent_response(&verdict, &call_action_id),
    };
    Ok(value.to_string())
}

/// If every artifact of this call carries a live consumed approval,
/// the earlier ask was answered: let the retry through.
fn apply_approvals(approvals: &ApprovalStore, request: &EvalRequest) -> Option<Verdict> {
    let artifacts =
        sage_core::extract::extract_artifacts(&request.tool_name, &request.tool_input);
    if artifacts.is_empty() {
        return None;
    }
    let session = request.session_id.as_deref().unwrap_or("");
    let all_consumed = artifacts.iter().all(|artifact| {
        approvals
            .find_consumed(session, artifact.kind, &artifact.value)
            .or_else(|| approvals.find_consumed_any_session(artifact.kind, &artifact.value))
            .is_some()
    });
    if !all_consumed {
        return None;
    }
    debug!("All artifacts carry consumed approvals; allowing");
    Some(Verdict::allow("approved"))
}

fn record_pending(
    approvals: &ApprovalStore,
    request: &EvalRequest,
    verdict: &Verdict,
    call_action_id: &str,
) {
    let session = request.session_id.as_deref().unwrap_or("");
    let key = request
        .tool_use_id
        .as_deref()
        .unwrap_or(call_action_id)
        .to_string();
    let record = PendingApproval::new(
        verdict.matched_threat_id.clone(),
        verdict
            .reasons
            .first()
            .cloned()
            .unwrap_or_else(|| "confirmation required".to_string()),
        sage_core::extract::extract_artifacts(&request.tool_name, &request.tool_input),
    );
    if let Err(e) = approvals.add_pending(session, &key, record) {
        warn!("Failed to record pending approval: {e:#}");
    }
}

fn run_approve(paths: &SagePaths, session: &str, id: &str, add_to_allowlist: bool) -> Result<()> {
    let approvals = ApprovalStore::new(&paths.state_dir);
    let Some(record) = approvals.consume_pending(session, id)? else {
        anyhow::bail!("no pending approval for session {session} id {id}");
    };
    println!(
        "approved: {} ({} artifact(s))",
        record.threat_title,
        record.artifacts.len()
    );

    if add_to_allowlist {
        let config = Config::load(&paths.config_path());
        let mut allowlist = Allowlist::load(&config.allowlist_path(&paths.state_dir));
        for artifact in &record.artifacts {
            match artifact.kind {
                sage_core::ArtifactKind::Url => {
                    allowlist.add_url(&artifact.value, "user approval", "ask")
                }
                sage_core::ArtifactKind::Command => {
                    allowlist.add_command(&artifact.value, "user approval", "ask")
                }
                sage_core::ArtifactKind::FilePath => {
                    allowlist.add_file_path(&artifact.value, "user approval", "ask")
                }
                sage_core::ArtifactKind::Content => {}
            }
        }
        allowlist.save()?;
        println!("allowlisted {} artifact(s)", record.artifacts.len());
    }
    Ok(())
}

fn run_allowlist(paths: &SagePaths, action: AllowlistAction) -> Result<()> {
    let config = Config::load(&paths.config_path());
    let mut allowlist = Allowlist::load(&config.allowlist_path(&paths.state_dir));
    match action {
        AllowlistAction::AddUrl { url, reason } => allowlist.add_url(&url, &reason, "manual"),
        AllowlistAction::AddCommand { command, reason } => {
            allowlist.add_command(&command, &reason, "manual")
        }
        AllowlistAction::AddPath { path, reason } => {
            allowlist.add_file_path(&path, &reason, "manual")
        }
        AllowlistAction::RemoveUrl { url } => {
            if !allowlist.remove_url(&url) {
                eprintln!("not present: {url}");
            }
        }
        AllowlistAction::RemoveCommand { command } => {
            if !allowlist.remove_command(&command) {
                eprintln!("not present");
            }
        }
        AllowlistAction::RemovePath { path } => {
            if !allowlist.remove_file_path(&path) {
                eprintln!("not present: {path}");
            }
        }
    }
    allowlist.save()?;
    Ok(())
}

async fn run_scan_plugins(paths: &SagePaths, dir: Option<PathBuf>, key: String) -> Result<()> {
    let config = Config::load(&paths.config_path());
    let plugins: Vec<PluginInfo> = match dir {
        Some(dir) => vec![PluginInfo {
            key,
            install_path: dir,
            version: String::new(),
            last_updated: String::new(),
        }],
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read plugin list from stdin")?;
            serde_json::from_str(&raw).context("Plugin list is not valid JSON")?
        }
    };

    let scanner = PluginScanner::new(paths.clone(), config);
    let reports = scanner.scan_session(&plugins).await;
    for report in &reports {
        for finding in &report.findings {
            println!(
                "{}",
                serde_json::json!({
                    "plugin": report.plugin_key,
                    "from_cache": report.from_cache,
                    "finding": finding,
                })
            );
        }
    }
    let total: usize = reports.iter().map(|r| r.findings.len()).sum();
    eprintln!("scanned {} plugin(s), {total} finding(s)", reports.len());
    Ok(())
}
