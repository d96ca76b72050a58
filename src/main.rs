use std::{fs::File, io::BufReader, process::ExitCode};

use clap::Parser;
use globset::Glob;
use segdex::{
    DataDir,
    config::{EngineConfig, SettingsDb, keys},
    error::{self, Error},
    indexer::{self, Publish},
    query::SearchQuery,
    schema::Schema,
    search::{self, SearchOptions},
    store::{SEGMENTS_DIR, SegmentStore},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SEGDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> error::Result<ExitCode> {
    // Vacuum works on an arbitrary root, not the data directory.
    let command = match cli.command {
        Command::Vacuum(args) => return cmd_vacuum(&args),
        Command::Completions(args) => {
            args.generate();
            return Ok(ExitCode::SUCCESS);
        }
        other => other,
    };

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let settings = SettingsDb::open(&data_dir.settings_db())?;

    match command {
        Command::Index(args) => cmd_index(&data_dir, &args)?,
        Command::Search(args) => cmd_search(&data_dir, &settings, &args)?,
        Command::Status(args) => cmd_status(&data_dir, &settings, &args)?,
        Command::Config { action } => cmd_config(&settings, action)?,
        Command::Vacuum(_) | Command::Completions(_) => {}
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_vacuum(args: &cli::VacuumArgs) -> error::Result<ExitCode> {
    if !args.root.is_dir() {
        eprintln!("Error: root does not exist: {}", args.root.display());
        return Ok(ExitCode::FAILURE);
    }

    let matcher = args
        .tenant
        .as_deref()
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .map_err(|e| {
                    Error::Configuration(format!(
                        "invalid tenant pattern '{pattern}': {e}"
                    ))
                })
        })
        .transpose()?;

    let root = DataDir::resolve(Some(&args.root))?;
    let selected: Vec<String> = root
        .tenants()?
        .into_iter()
        .filter(|name| matcher.as_ref().is_none_or(|m| m.is_match(name)))
        .collect();
    if selected.is_empty() {
        println!("No tenants with segments under {}", args.root.display());
        return Ok(ExitCode::SUCCESS);
    }

    for name in selected {
        let store = SegmentStore::open(&root.root().join(&name))?;
        let files = store.list()?;
        println!("{name}: {} segment file(s)", files.len());
        for file in &files {
            let docs = file
                .meta
                .as_ref()
                .map_or_else(|| "unreadable".to_string(), |m| {
                    format!("{} docs", m.doc_count)
                });
            println!("  {} {} bytes, {docs}", file.id, file.size_bytes);
        }

        if args.dry_run {
            if let Some(keep) = args.prune {
                let excess = files.len().saturating_sub(keep);
                println!("  would prune {excess} segment(s)");
            }
            continue;
        }

        if let Some(keep) = args.prune {
            let removed = store.prune(keep)?;
            println!("  pruned {} segment(s)", removed.len());
        }
        let report = store.compact()?;
        println!(
            "  vacuumed {} file(s), removed {} temporary file(s), {} -> {} bytes",
            report.vacuumed,
            report.temp_files_removed,
            report.bytes_before,
            report.bytes_after
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_index(data_dir: &DataDir, args: &cli::IndexArgs) -> error::Result<()> {
    let file = File::open(&args.input).map_err(|e| {
        Error::Configuration(format!(
            "cannot open {}: {e}",
            args.input.display()
        ))
    })?;
    let documents = indexer::read_jsonl(BufReader::new(file))?;
    let count = documents.len();

    let store = SegmentStore::open(&data_dir.tenant_dir(&args.tenant)?)?;
    match indexer::index_documents(&store, Schema::documentation(), documents)?
    {
        Publish::Saved(path) => {
            println!("Indexed {count} document(s) into {}", path.display());
        }
        Publish::Unchanged(id) => {
            println!("Content unchanged; segment {id} is current");
        }
    }
    Ok(())
}

fn cmd_search(
    data_dir: &DataDir,
    settings: &SettingsDb,
    args: &cli::SearchArgs,
) -> error::Result<()> {
    let config = EngineConfig::load(settings)?;
    let root = data_dir.tenant_path(&args.tenant)?;
    let query = SearchQuery::new(&args.query).with_tenant(&args.tenant);
    let options = SearchOptions {
        max_results: args.count,
        word_match: args.word_match,
        include_stats: args.stats,
    };

    let response =
        search::search_documents_with(&query, &root, &options, config);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        search::format_human(&response);
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    settings: &SettingsDb,
    args: &cli::StatusArgs,
) -> error::Result<()> {
    let config = EngineConfig::load(settings)?;
    let tenants = match &args.tenant {
        Some(tenant) => vec![tenant.clone()],
        None => data_dir.tenants()?,
    };

    let mut report = Vec::new();
    for tenant in &tenants {
        let root = data_dir.tenant_path(tenant)?;
        if !root.join(SEGMENTS_DIR).is_dir() {
            return Err(Error::NotFound {
                kind: "tenant",
                name: tenant.clone(),
            });
        }
        let store = SegmentStore::open(&root)?;
        let files = store.list()?;
        let latest = files.last().and_then(|f| f.meta.clone());
        report.push(serde_json::json!({
            "tenant": tenant,
            "segments": files.len(),
            "bytes": files.iter().map(|f| f.size_bytes).sum::<u64>(),
            "latest": latest.as_ref().map(|m| m.id.to_string()),
            "documents": latest.as_ref().map(|m| m.doc_count),
            "fingerprint": latest.as_ref().map(|m| m.fingerprint.clone()),
        }));
    }

    if args.json {
        let status = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "config": config,
            "tenants": report,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Strategy: {}", config.strategy);
    println!("Tenants: {}", report.len());
    for entry in &report {
        println!(
            "  {}: {} segment(s), latest {} with {} document(s)",
            entry["tenant"].as_str().unwrap_or_default(),
            entry["segments"],
            entry["latest"].as_str().unwrap_or("-"),
            entry["documents"].as_u64().unwrap_or(0),
        );
    }
    Ok(())
}

fn cmd_config(
    settings: &SettingsDb,
    action: ConfigAction,
) -> error::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let default = EngineConfig::default_value(&key)?;
            println!("{}", settings.get_or(&key, &default)?);
        }
        ConfigAction::Set { key, value } => {
            EngineConfig::check_setting(&key, &value)?;
            settings.set(&key, &value)?;
            println!("{key} = {value}");
        }
        ConfigAction::Unset { key } => {
            if settings.remove(&key)? {
                println!("Removed {key}");
            } else {
                println!("{key} was not set");
            }
        }
        ConfigAction::List { json } => {
            let config = EngineConfig::load(settings)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                for key in keys::ALL {
                    let default = EngineConfig::default_value(key)?;
                    println!("{key} = {}", settings.get_or(key, &default)?);
                }
            }
        }
    }
    Ok(())
}
