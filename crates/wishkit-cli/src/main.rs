use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use time::{OffsetDateTime, PrimitiveDateTime};
use wishkit_core::{patch_id64, strip_player_scope, ExportMeta, PlayerShelf};
use wishkit_fetch::{extract_auths, find_logfile, GachaLogClient, FETCH_POOLS};
use wishkit_formats::{
    detect, formats, migrate_legacy, read_json, write_json, BiuuuFormat, JsonFormat, UigfFormat,
};

const APP_NAME: &str = "wishkit";

#[derive(Debug, Parser)]
#[command(name = "wishkit")]
#[command(about = "Wish archive toolkit: convert, migrate, patch and fetch gacha history")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    List,
    Convert(ConvertArgs),
    Migrate(MigrateArgs),
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    file: PathBuf,
    #[arg(long)]
    save_to: PathBuf,
    #[arg(long, value_enum)]
    reader: Option<FormatArg>,
    #[arg(long, value_enum)]
    writer: Option<FormatArg>,
    #[arg(long)]
    uid: Option<String>,
    #[arg(long, default_value_t = false)]
    patch_id64: bool,
    #[arg(long, default_value_t = false)]
    minimum: bool,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    file: PathBuf,
    #[arg(long)]
    save_to: PathBuf,
    #[arg(long, default_value_t = false)]
    minimum: bool,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long)]
    auth_url: Option<String>,
    #[arg(long)]
    logfile: Option<PathBuf>,
    #[arg(long)]
    save_to: PathBuf,
    #[arg(long)]
    merge_into: Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    delay_ms: u64,
    #[arg(long, default_value_t = false)]
    minimum: bool,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Uigf,
    Biuuu,
}

impl FormatArg {
    fn into_format(self) -> &'static dyn JsonFormat {
        match self {
            FormatArg::Uigf => &UigfFormat,
            FormatArg::Biuuu => &BiuuuFormat,
        }
    }
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::List => run_list(),
        Command::Convert(args) => run_convert(&args),
        Command::Migrate(args) => run_migrate(&args),
        Command::Fetch(args) => run_fetch(&args),
    }
}

fn run_list() -> Result<()> {
    let known = formats()
        .iter()
        .map(|format| {
            json!({
                "name": format.name(),
                "description": format.description(),
            })
        })
        .collect::<Vec<_>>();
    emit_json(&json!({ "formats": known }))
}

fn run_convert(args: &ConvertArgs) -> Result<()> {
    let archive = read_json(&args.file)?;
    let reader = match args.reader {
        Some(choice) => choice.into_format(),
        None => {
            let Some(found) = detect(&archive) else {
                return Err(anyhow!(
                    "cannot tell which dialect {} is written in; pass --reader",
                    args.file.display()
                ));
            };
            found
        }
    };

    let outcome = reader
        .load(&archive)
        .with_context(|| format!("failed to load {} as {}", args.file.display(), reader.name()))?;
    let mut shelf = outcome.shelf;
    tracing::info!(
        reader = reader.name(),
        rows_read = outcome.rows_read,
        rows_loaded = outcome.rows_loaded,
        "archive loaded"
    );

    let patch = if args.patch_id64 {
        Some(patch_id64(&mut shelf, args.uid.as_deref()))
    } else {
        None
    };

    let writer = args.writer.unwrap_or(FormatArg::Uigf).into_format();
    let dumped = writer.dump(&shelf, &export_meta())?;
    ensure_writable(&args.save_to, args.force)?;
    write_json(&args.save_to, &dumped, args.minimum)?;

    emit_json(&json!({
        "source": args.file,
        "destination": args.save_to,
        "reader": reader.name(),
        "writer": writer.name(),
        "rows_read": outcome.rows_read,
        "rows_loaded": outcome.rows_loaded,
        "records_written": shelf.total(),
        "patch": patch,
    }))
}

fn run_migrate(args: &MigrateArgs) -> Result<()> {
    let archive = read_json(&args.file)?;
    let wish = migrate_legacy(&archive)
        .with_context(|| format!("failed to migrate legacy archive {}", args.file.display()))?;

    let records = wish.len();
    let mut shelf = PlayerShelf::new(&wish.uid, &wish.region, &wish.language);
    shelf.absorb(wish);

    let dumped = UigfFormat.dump(&shelf, &export_meta())?;
    ensure_writable(&args.save_to, args.force)?;
    write_json(&args.save_to, &dumped, args.minimum)?;

    emit_json(&json!({
        "source": args.file,
        "destination": args.save_to,
        "uid": shelf.uid,
        "records": records,
    }))
}

fn run_fetch(args: &FetchArgs) -> Result<()> {
    let client = match args.auth_url.as_deref() {
        Some(raw) => GachaLogClient::from_auth_url(raw)?,
        None => {
            let logfile = match args.logfile.clone() {
                Some(path) => path,
                None => find_logfile()?,
            };
            tracing::info!(logfile = %logfile.display(), "reading auth material from client logfile");
            let pairs = extract_auths(&logfile)?;
            GachaLogClient::from_query_pairs(pairs)?
        }
    };
    client.available()?;

    let delay = std::time::Duration::from_millis(args.delay_ms);
    let mut shelf = PlayerShelf::default();
    for pool in FETCH_POOLS {
        let wish = client.collect(pool, |_| std::thread::sleep(delay))?;
        shelf.absorb(wish);
    }

    let mut merged_into = None;
    if let Some(path) = args.merge_into.as_ref() {
        let archive = read_json(path)?;
        let Some(reader) = detect(&archive) else {
            return Err(anyhow!(
                "cannot tell which dialect {} is written in",
                path.display()
            ));
        };
        let base = reader
            .load(&archive)
            .with_context(|| format!("failed to load {} as {}", path.display(), reader.name()))?;
        let mut base_shelf = base.shelf;
        base_shelf.merge(shelf)?;
        shelf = base_shelf;
        merged_into = Some(path.clone());
    }
    for wish in shelf.wishes.values_mut() {
        wish.sort();
        wish.deduplicate();
        wish.maps(strip_player_scope);
    }

    let dumped = UigfFormat.dump(&shelf, &export_meta())?;
    ensure_writable(&args.save_to, args.force)?;
    write_json(&args.save_to, &dumped, args.minimum)?;

    emit_json(&json!({
        "uid": shelf.uid,
        "region": shelf.region,
        "records": shelf.total(),
        "destination": args.save_to,
        "merged_into": merged_into,
    }))
}

fn export_meta() -> ExportMeta {
    let now = OffsetDateTime::now_utc();
    ExportMeta::new(
        APP_NAME,
        env!("CARGO_PKG_VERSION"),
        PrimitiveDateTime::new(now.date(), now.time()),
    )
}

fn ensure_writable(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "refusing to overwrite {}; pass --force to replace it",
            path.display()
        ));
    }
    Ok(())
}
