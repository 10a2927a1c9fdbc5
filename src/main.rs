//! rockfall_service: scheduler, on-demand evaluation and admin commands.
//!
//! Usage:
//!   rockfall_service [--config PATH] [--sites PATH] [--dry-run] [COMMAND]
//!
//! Commands (default: run the scheduler until killed):
//!   --once            run a single cycle and exit
//!   --evaluate SITE   evaluate one site now and print the assessment
//!   --verify          preflight check of every active site
//!   --seed-sites      upsert the site registry into storage
//!   --migrate         apply the database schema
//!
//! `--dry-run` keeps everything in memory (sites come from the registry
//! file) and logs alerts instead of sending them.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use rockfall_service::config::{Secrets, Settings};
use rockfall_service::ingest::{FdsnEventClient, FeatureCollector, OpenWeatherClient, WeatherSource};
use rockfall_service::logging::{Source, init_logging};
use rockfall_service::model::Channel;
use rockfall_service::notify::{HttpEmailProvider, LogOnlyProvider, NotificationDispatcher, TwilioSmsProvider};
use rockfall_service::pipeline::{AlertOutcome, SiteEvaluator};
use rockfall_service::scheduler::SiteEvaluationScheduler;
use rockfall_service::sites::{load_sites, seed_sites};
use rockfall_service::storage::{MemoryStore, PostgresStore, Storage};
use rockfall_service::verify::{LiveSources, print_summary, run_verification};

const DEFAULT_CONFIG: &str = "rockfall.toml";
const DEFAULT_SITES: &str = "sites.toml";

#[derive(Debug, PartialEq)]
enum Command {
    Run,
    Once,
    Evaluate(String),
    Verify,
    SeedSites,
    Migrate,
    Help,
}

#[derive(Debug)]
struct Options {
    config_path: Option<String>,
    sites_path: String,
    dry_run: bool,
    command: Command,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_args(&args)?;
    if options.command == Command::Help {
        print_help();
        return Ok(());
    }

    let settings = match &options.config_path {
        Some(path) => Settings::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Settings::from_file(DEFAULT_CONFIG)?,
        None => Settings::default(),
    };
    init_logging(&settings.logging.level, settings.logging.json);
    let secrets = Secrets::from_env();
    tracing::debug!(source = %Source::Scheduler, ?secrets, "configuration loaded");

    if options.command == Command::Migrate {
        let store = PostgresStore::connect(secrets.require_database_url()?, settings.scheduler.call_timeout())?;
        store.migrate()?;
        println!("Schema applied.");
        return Ok(());
    }

    let storage: Arc<dyn Storage> = if options.dry_run {
        Arc::new(MemoryStore::with_sites(load_sites(&options.sites_path)?))
    } else {
        Arc::new(PostgresStore::connect(
            secrets.require_database_url()?,
            settings.scheduler.call_timeout(),
        )?)
    };

    if options.command == Command::SeedSites {
        let sites = load_sites(&options.sites_path)?;
        let count = seed_sites(storage.as_ref(), &sites)?;
        println!("Seeded {} site(s) from {}.", count, options.sites_path);
        return Ok(());
    }

    let timeout = settings.scheduler.call_timeout();
    let weather = match &secrets.weather_api_key {
        Some(key) => Some(OpenWeatherClient::new(&settings.sources.weather_url, key, timeout)?),
        None => {
            tracing::warn!(source = %Source::Weather, "OWM_API_KEY not set; feature collection disabled");
            None
        }
    };
    let seismic = FdsnEventClient::new(
        &settings.sources.seismic_url,
        settings.features.seismic_radius_km,
        settings.features.seismic_min_magnitude,
        timeout,
    )?;

    if options.command == Command::Verify {
        let sources = LiveSources {
            weather: weather.as_ref().map(|w| w as &dyn WeatherSource),
            seismic: Some(&seismic),
        };
        let report = run_verification(storage.as_ref(), sources, settings.features.max_snapshot_age(), Utc::now())?;
        print_summary(&report);
        if report.summary.failed > 0 {
            return Err(format!("{} site(s) failed verification", report.summary.failed).into());
        }
        return Ok(());
    }

    let dispatcher = build_dispatcher(&settings, &secrets, options.dry_run)?;
    let evaluator = Arc::new(
        SiteEvaluator::new(storage.clone(), &settings, dispatcher).with_seismic_source(Box::new(seismic)),
    );

    if let Command::Evaluate(site_id) = &options.command {
        let outcome = evaluator.evaluate_site(site_id)?;
        println!("{}", serde_json::to_string_pretty(&outcome.assessment)?);
        match &outcome.alert {
            AlertOutcome::NotRequired => println!("Alert: not required"),
            AlertOutcome::Suppressed { .. } => println!("Alert: suppressed by throttle window"),
            AlertOutcome::Dispatched(record) => println!("Alert: {} ({})", record.status, record.id),
        }
        return Ok(());
    }

    let mut scheduler = SiteEvaluationScheduler::new(evaluator, settings.scheduler.clone())?;
    if let Some(weather) = weather {
        scheduler = scheduler.with_collector(FeatureCollector::new(storage.clone(), Box::new(weather)));
    }

    if options.command == Command::Once {
        let summary = scheduler.run_cycle(Utc::now());
        println!(
            "{}/{} evaluated, {} failed, {} alerts dispatched, {} suppressed",
            summary.evaluated, summary.total, summary.failed, summary.alerts_dispatched, summary.alerts_suppressed
        );
        return Ok(());
    }

    let handle = scheduler.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!(source = %Source::Scheduler, "signal received; finishing running sites");
        handle.shutdown();
    })?;

    scheduler.run();
    Ok(())
}

fn build_dispatcher(settings: &Settings, secrets: &Secrets, dry_run: bool) -> Result<NotificationDispatcher, Box<dyn Error>> {
    let mut dispatcher = NotificationDispatcher::new();
    if dry_run {
        for channel in Channel::ALL {
            dispatcher.register(Box::new(LogOnlyProvider { channel }));
        }
        return Ok(dispatcher);
    }

    let timeout = settings.scheduler.call_timeout();
    match (&settings.channels.email, &secrets.email_api_key) {
        (Some(email), Some(key)) => dispatcher.register(Box::new(HttpEmailProvider::new(email, key, timeout)?)),
        (Some(_), None) => {
            tracing::warn!(source = %Source::Dispatch, "EMAIL_API_KEY not set; email alerts will fail")
        }
        (None, _) => {}
    }
    match (&settings.channels.sms, &secrets.twilio_account_sid, &secrets.twilio_auth_token) {
        (Some(sms), Some(sid), Some(token)) => {
            dispatcher.register(Box::new(TwilioSmsProvider::new(sms, sid, token, timeout)?))
        }
        (Some(_), _, _) => {
            tracing::warn!(source = %Source::Dispatch, "Twilio credentials not set; SMS alerts will fail")
        }
        (None, _, _) => {}
    }
    Ok(dispatcher)
}

fn parse_args(args: &[String]) -> Result<Options, Box<dyn Error>> {
    let mut options = Options {
        config_path: None,
        sites_path: DEFAULT_SITES.to_string(),
        dry_run: false,
        command: Command::Run,
    };

    let mut i = 0;
    while i < args.len() {
        let command = match args[i].as_str() {
            "--config" => {
                i += 1;
                options.config_path = Some(args.get(i).ok_or("Missing config path")?.clone());
                None
            }
            "--sites" => {
                i += 1;
                options.sites_path = args.get(i).ok_or("Missing sites path")?.clone();
                None
            }
            "--dry-run" => {
                options.dry_run = true;
                None
            }
            "--once" => Some(Command::Once),
            "--evaluate" => {
                i += 1;
                Some(Command::Evaluate(args.get(i).ok_or("Missing site id")?.clone()))
            }
            "--verify" => Some(Command::Verify),
            "--seed-sites" => Some(Command::SeedSites),
            "--migrate" => Some(Command::Migrate),
            "--help" | "-h" => Some(Command::Help),
            other => return Err(format!("Unknown option: {}", other).into()),
        };
        if let Some(command) = command {
            if options.command != Command::Run {
                return Err("Only one command may be given".into());
            }
            options.command = command;
        }
        i += 1;
    }

    Ok(options)
}

fn print_help() {
    println!("rockfall_service - rockfall risk monitoring");
    println!();
    println!("USAGE:");
    println!("  rockfall_service [--config PATH] [--sites PATH] [--dry-run] [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("  (none)            run the scheduler");
    println!("  --once            run a single evaluation cycle");
    println!("  --evaluate SITE   evaluate one site now");
    println!("  --verify          preflight check of active sites");
    println!("  --seed-sites      load the site registry into storage");
    println!("  --migrate         apply the database schema");
    println!();
    println!("ENVIRONMENT (or .env):");
    println!("  DATABASE_URL, OWM_API_KEY, EMAIL_API_KEY, TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN");
}
