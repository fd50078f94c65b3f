use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use linkhash_app::cli::{
    Cli, Commands, ExportArgs, JobsArgs, JobsCommands, RecordsArgs, RecordsCommands, ServeArgs,
};
use linkhash_app::config::{self, AppConfig};
use linkhash_app::error::AppError;
use linkhash_app::paths::AppPaths;
use linkhash_app::runtime::LinkageRuntime;
use linkhash_app::services::{JobStore, PageRequest};
use linkhash_server::{DynLinkageApi, JobView, RecordFilter};
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command else {
        Cli::print_help();
        return Ok(());
    };

    let mut cfg = config::load()?;
    if let Some(data_dir) = cli.data_dir {
        cfg.storage.path = data_dir;
    }

    match command {
        Commands::Serve(args) => serve(cfg, args).await,
        Commands::Jobs(args) => run_jobs(cfg, args).await,
        Commands::Records(args) => run_records(&cfg, args),
    }
}

async fn serve(mut cfg: AppConfig, args: ServeArgs) -> Result<(), AppError> {
    if let Some(listen) = args.listen {
        cfg.server.listen_addr = listen;
    }
    let runtime = LinkageRuntime::from_config(&cfg)?;
    let api: DynLinkageApi = Arc::new(runtime.service());
    tracing::info!(
        data_dir = %cfg.storage.path.display(),
        workers = cfg.workers.concurrency,
        chunk_size = cfg.workers.chunk_size,
        "starting linkhash"
    );
    let served = linkhash_server::serve(cfg.server.clone(), api).await;
    runtime.shutdown().await;
    served.map_err(AppError::from)
}

fn open_store(cfg: &AppConfig) -> Result<JobStore, AppError> {
    let paths = AppPaths::new(&cfg.storage.path)?;
    Ok(JobStore::open_with_map_size(
        &paths,
        cfg.storage.map_size_bytes,
    )?)
}

async fn run_jobs(cfg: AppConfig, args: JobsArgs) -> Result<(), AppError> {
    match args.command {
        JobsCommands::List => {
            let store = open_store(&cfg)?;
            for job_id in store.list_job_ids()? {
                println!("{job_id}");
            }
        }
        JobsCommands::Show(args) => {
            let store = open_store(&cfg)?;
            let job = store
                .get_job(&args.job_id)?
                .ok_or_else(|| AppError::JobNotFound(args.job_id.clone()))?;
            let view = JobView {
                job_id: job.job_id,
                schema: serde_json::from_str(&job.schema_json)?,
            };
            print_json(&view)?;
        }
        JobsCommands::Status(args) => {
            let store = open_store(&cfg)?;
            print_json(&store.status_ranges(&args.job_id)?)?;
        }
        JobsCommands::Delete(args) => {
            let store = open_store(&cfg)?;
            let removed = store.delete_job(&args.job_id)?;
            println!("deleted job `{}` ({removed} records)", args.job_id);
        }
        JobsCommands::Redispatch(args) => {
            let runtime = LinkageRuntime::from_config(&cfg)?;
            let receipt = runtime
                .service()
                .redispatch_queued(&args.job_id, !args.no_validate);
            runtime.drain().await;
            print_json(&receipt?)?;
        }
        JobsCommands::Requeue(args) => {
            let runtime = LinkageRuntime::from_config(&cfg)?;
            let service = runtime.service();
            let requeued = service.requeue_in_progress(&args.job_id);
            let receipt = match (&requeued, args.redispatch) {
                (Ok(_), true) => Some(service.redispatch_queued(&args.job_id, true)),
                _ => None,
            };
            drop(service);
            runtime.drain().await;
            println!("requeued {} records", requeued?);
            if let Some(receipt) = receipt {
                print_json(&receipt?)?;
            }
        }
    }
    Ok(())
}

fn run_records(cfg: &AppConfig, args: RecordsArgs) -> Result<(), AppError> {
    match args.command {
        RecordsCommands::Export(args) => export_records(cfg, args),
    }
}

fn export_records(cfg: &AppConfig, args: ExportArgs) -> Result<(), AppError> {
    let store = open_store(cfg)?;
    if store.get_job(&args.job_id)?.is_none() {
        return Err(AppError::JobNotFound(args.job_id));
    }
    let mut request = PageRequest {
        filter: RecordFilter {
            index_start: args.index_start,
            index_end: args.index_end,
            statuses: args.status,
        },
        limit: args.page_size,
        cursor: None,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut exported = 0_u64;
    loop {
        let page = store.list_page(&args.job_id, &request)?;
        for record in &page.records {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n").map_err(AppError::Output)?;
            exported += 1;
        }
        match page.next_cursor {
            Some(cursor) => request.cursor = Some(cursor),
            None => break,
        }
    }
    out.flush().map_err(AppError::Output)?;
    tracing::info!(job_id = %args.job_id, exported, "records exported");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
