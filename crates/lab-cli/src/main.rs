use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lab_ledger::{
    hash_params, open_ledger, set_global_lock, Aggregator, FileLock, Ledger, LedgerConfig, NewRun,
    ParamHash, RunRecord, RunSet, RunUpdate, Status,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lab", version = "0.3.0", about = "Run ledger CLI")]
struct Cli {
    #[arg(long, global = true, default_value = lab_ledger::DEFAULT_LEDGER_FILE)]
    ledger: PathBuf,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    lock_file: Option<PathBuf>,
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    maxsize: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    #[value(name = "pending")]
    Pending,
    #[value(name = "running")]
    Running,
    #[value(name = "done")]
    Done,
    #[value(name = "error")]
    Error,
}

impl From<StatusArg> for Status {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Status::Pending,
            StatusArg::Running => Status::Running,
            StatusArg::Done => Status::Done,
            StatusArg::Error => Status::Error,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Allocate {
        identifier: String,
        #[arg(long, default_value = ".")]
        relpath: String,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long, allow_hyphen_values = true)]
        param_hash: Option<ParamHash>,
        #[arg(long, conflicts_with = "param_hash")]
        params: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Log {
        identifier: String,
        uid: String,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Show {
        identifier: String,
        uid: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Find {
        identifier: String,
        #[arg(long, allow_hyphen_values = true)]
        param_hash: Option<ParamHash>,
        #[arg(long, conflicts_with = "param_hash")]
        params: Option<String>,
        #[arg(long)]
        json: bool,
    },
    HashParams {
        params: String,
        #[arg(long)]
        json: bool,
    },
    Aggregate {
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
        #[arg(long)]
        tag: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<LedgerConfig> {
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    }
    .apply_env()?;
    if let Some(maxsize) = cli.maxsize {
        config.maxsize = maxsize;
    }
    if let Some(ms) = cli.lock_timeout_ms {
        config.lock_timeout_ms = Some(ms);
    }
    Ok(config.validated()?)
}

fn run(cli: Cli) -> Result<Option<Value>> {
    let config = resolve_config(&cli)?;
    if let Some(lock_file) = &cli.lock_file {
        set_global_lock(Some(Arc::new(FileLock::new(lock_file))));
    }
    let ledger = open_ledger(&cli.ledger, config)?;
    run_command(&ledger, cli.command)
}

fn run_command(ledger: &Arc<Ledger>, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Allocate {
            identifier,
            relpath,
            status,
            param_hash,
            params,
            json,
        } => {
            let param_hash = resolve_param_hash(param_hash, params.as_deref())?;
            let run = NewRun::default()
                .with_status(status.map(Into::into).unwrap_or_default())
                .with_relpath(relpath)
                .with_param_hash(param_hash);
            let uid = ledger.allocate(&identifier, run)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "allocate",
                    "identifier": identifier,
                    "uid": uid,
                    "param_hash": param_hash,
                    "ledger": ledger.path().display().to_string()
                })));
            }
            println!("{}", uid);
        }
        Commands::Log {
            identifier,
            uid,
            status,
            files,
            json,
        } => {
            let mut update = RunUpdate::files(parse_file_bindings(&files)?);
            if let Some(status) = status {
                update = update.with_status(status.into());
            }
            let noop = update.is_empty();
            ledger.log(&identifier, &uid, update)?;
            let record = if noop {
                None
            } else {
                Some(ledger.get_record(&identifier, &uid)?)
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "log",
                    "identifier": identifier,
                    "uid": uid,
                    "noop": noop,
                    "record": record.as_ref().map(record_to_json).transpose()?
                })));
            }
            match record {
                Some(record) => print_record(&uid, &record),
                None => println!("nothing to log"),
            }
        }
        Commands::Show {
            identifier,
            uid,
            json,
        } => {
            let runs: RunSet = match &uid {
                Some(uid) => {
                    let record = ledger.get_record(&identifier, uid)?;
                    RunSet::from([(uid.clone(), record)])
                }
                None => ledger.get_uid_record_dict(&identifier)?,
            };
            if json {
                let mut out = serde_json::Map::new();
                for (uid, record) in &runs {
                    out.insert(uid.clone(), record_to_json(record)?);
                }
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "identifier": identifier,
                    "runs": out
                })));
            }
            for (uid, record) in &runs {
                print_record(uid, record);
            }
        }
        Commands::Find {
            identifier,
            param_hash,
            params,
            json,
        } => {
            let param_hash = resolve_param_hash(param_hash, params.as_deref())?;
            let hit = ledger.find_by_param_hash(&identifier, param_hash)?;
            if json {
                let found = match &hit {
                    Some((uid, record)) => json!({"uid": uid, "record": record_to_json(record)?}),
                    None => Value::Null,
                };
                return Ok(Some(json!({
                    "ok": true,
                    "command": "find",
                    "identifier": identifier,
                    "param_hash": param_hash,
                    "found": found
                })));
            }
            match hit {
                Some((uid, record)) => print_record(&uid, &record),
                None => println!("no match"),
            }
        }
        Commands::HashParams { params, json } => {
            let param_hash = resolve_param_hash(None, Some(&params))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "hash-params",
                    "param_hash": param_hash
                })));
            }
            match param_hash {
                Some(h) => println!("{}", h),
                None => println!("none"),
            }
        }
        Commands::Aggregate { groups, tag, json } => {
            let groups = parse_groups(&groups)?;
            let out = Aggregator::new(groups, Arc::clone(ledger)).aggregate(&tag)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "tag": tag,
                    "groups": out
                })));
            }
            for (name, rows) in &out {
                println!("{}:", name);
                for row in rows {
                    println!("  {}", serde_json::to_string(row)?);
                }
            }
        }
    }
    Ok(None)
}

fn resolve_param_hash(
    param_hash: Option<ParamHash>,
    params: Option<&str>,
) -> Result<Option<ParamHash>> {
    match (param_hash, params) {
        (Some(h), _) => Ok(Some(h)),
        (None, Some(raw)) => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| anyhow!("invalid --params '{}': {}", raw, e))?;
            if !value.is_object() {
                return Err(anyhow!("invalid --params '{}': expected a JSON object", raw));
            }
            Ok(hash_params(&value))
        }
        (None, None) => Ok(None),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<lab_ledger::LedgerError>() {
        Some(e) if e.is_not_found() => "not_found",
        Some(e) if e.is_capacity_exceeded() => "capacity_exceeded",
        Some(lab_ledger::LedgerError::Validation { .. }) => "validation_failed",
        Some(lab_ledger::LedgerError::LockTimeout { .. }) => "lock_timeout",
        _ => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Allocate { json, .. }
        | Commands::Log { json, .. }
        | Commands::Show { json, .. }
        | Commands::Find { json, .. }
        | Commands::HashParams { json, .. }
        | Commands::Aggregate { json, .. } => *json,
    }
}

fn record_to_json(record: &RunRecord) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

fn print_record(uid: &str, record: &RunRecord) {
    println!("uid: {}", uid);
    println!("  status: {}", record.status);
    println!("  relpath: {}", record.relpath);
    match record.param_hash {
        Some(h) => println!("  param_hash: {}", h),
        None => println!("  param_hash: none"),
    }
    println!("  status_time: {}", record.status_time.to_rfc3339());
    if let Some(t) = record.start_time {
        println!("  start_time: {}", t.to_rfc3339());
    }
    if let Some(t) = record.end_time {
        println!("  end_time: {}", t.to_rfc3339());
    }
    for (tag, path) in &record.files {
        println!("  file[{}]: {}", tag, path);
    }
}

fn parse_file_bindings(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (tag, path) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --file '{}': expected tag=path", raw))?;
        if tag.trim().is_empty() {
            return Err(anyhow!("invalid --file '{}': tag cannot be empty", raw));
        }
        out.insert(tag.to_string(), path.to_string());
    }
    Ok(out)
}

fn parse_groups(values: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (name, ids) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --group '{}': expected name=id1,id2", raw))?;
        let identifiers: Vec<String> = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if name.trim().is_empty() || identifiers.is_empty() {
            return Err(anyhow!(
                "invalid --group '{}': name and at least one identifier required",
                raw
            ));
        }
        out.insert(name.to_string(), identifiers);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_bindings_split_on_first_equals() {
        let parsed = parse_file_bindings(&["data=out/a=b.json".to_string()]).expect("parse");
        assert_eq!(parsed["data"], "out/a=b.json");
        assert!(parse_file_bindings(&["nope".to_string()]).is_err());
        assert!(parse_file_bindings(&["=x".to_string()]).is_err());
    }

    #[test]
    fn groups_parse_comma_lists() {
        let parsed = parse_groups(&["grp=id_A, id_B".to_string()]).expect("parse");
        assert_eq!(parsed["grp"], vec!["id_A".to_string(), "id_B".to_string()]);
        assert!(parse_groups(&["grp=".to_string()]).is_err());
        assert!(parse_groups(&["grp".to_string()]).is_err());
    }

    #[test]
    fn param_hash_prefers_explicit_value() {
        assert_eq!(resolve_param_hash(Some(-3), None).expect("hash"), Some(-3));
        assert_eq!(resolve_param_hash(None, None).expect("none"), None);
        let from_json = resolve_param_hash(None, Some(r#"{"lr": 0.1}"#)).expect("hash");
        assert_eq!(from_json, hash_params(&json!({"lr": 0.1})));
        assert!(resolve_param_hash(None, Some("[1]")).is_err());
    }

    #[test]
    fn cli_parses_log_with_files() {
        let cli = Cli::try_parse_from([
            "lab", "--ledger", "/tmp/m.json", "log", "train", "000", "--status", "done", "--file",
            "data=out.json", "--json",
        ])
        .expect("parse");
        assert_eq!(cli.ledger, PathBuf::from("/tmp/m.json"));
        match cli.command {
            Commands::Log {
                identifier,
                uid,
                status,
                files,
                json,
            } => {
                assert_eq!(identifier, "train");
                assert_eq!(uid, "000");
                assert!(matches!(status, Some(StatusArg::Done)));
                assert_eq!(files, vec!["data=out.json".to_string()]);
                assert!(json);
            }
            _ => panic!("expected log"),
        }
    }

    #[test]
    fn error_codes_classify_ledger_errors() {
        let err = anyhow::Error::new(lab_ledger::LedgerError::RunNotFound {
            identifier: "a".to_string(),
            uid: "000".to_string(),
        });
        assert_eq!(error_code(&err), "not_found");
        let err = anyhow::Error::new(lab_ledger::LedgerError::CapacityExceeded {
            identifier: "a".to_string(),
            maxsize: 1,
        });
        assert_eq!(error_code(&err), "capacity_exceeded");
        assert_eq!(error_code(&anyhow!("other")), "command_failed");
    }
}
