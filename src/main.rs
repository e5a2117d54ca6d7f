use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{Router, extract::Query};
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use httplog::{
    Request, RequestLog, Response, Server, ShutdownOutcome,
    config::{ServerConfig, ServerConfigValidator, load_config},
    metrics, tracing_setup,
    utils::GracefulShutdown,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "httplog.yaml")]
        config: String,
    },
    /// Start the demo server (default)
    Serve {
        /// Configuration file to use; built-in defaults when omitted
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct SumParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct Sum {
    a: i64,
    b: i64,
    result: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config),
        Some(Commands::Serve { config }) => serve(config.or(args.config)).await,
        None => serve(args.config).await,
    }
}

async fn serve(config_path: Option<String>) -> Result<()> {
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    ServerConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing_setup::init_from_config(&config.logging)?;
    metrics::init_metrics();

    let server = Server::new(&config);
    let app = routes(&server);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!("Listening on {}", config.listen_addr);

    let shutdown = Arc::new(GracefulShutdown::new());
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.run_signal_handler().await });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut serving = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .into_future(),
    );

    tokio::select! {
        result = &mut serving => {
            result.wrap_err("Server task failed")?.wrap_err("Server error")?;
            return Ok(());
        }
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutting down: {:?}", reason);
        }
    }

    let outcome = server.shutdown().await;
    let _ = stop_tx.send(());
    match outcome {
        ShutdownOutcome::Drained => {
            serving
                .await
                .wrap_err("Server task failed")?
                .wrap_err("Server error")?;
        }
        ShutdownOutcome::DeadlineExceeded { remaining } => {
            tracing::warn!("Aborting {} connections still open", remaining);
            serving.abort();
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

fn routes(server: &Server) -> Router {
    Router::new()
        .route_service(
            "/hello",
            server.handle("hello", |_req: Request, _log: RequestLog| async move {
                Ok::<_, eyre::Report>(Response::text("hello, world"))
            }),
        )
        .route_service(
            "/sum",
            server.handle("sum", |req: Request, log: RequestLog| async move {
                let Query(params) = Query::<SumParams>::try_from_uri(req.uri())
                    .wrap_err("expected query parameters a and b")?;
                log.add_fields([("a", params.a), ("b", params.b)]);
                Ok::<_, eyre::Report>(Response::json(Sum {
                    a: params.a,
                    b: params.b,
                    result: params.a + params.b,
                }))
            }),
        )
        .route_service(
            "/panic",
            server.handle("panic", |_req: Request, log: RequestLog| async move {
                log.add_field("about_to", "panic");
                let empty: Vec<u8> = Vec::new();
                Ok::<_, eyre::Report>(Response::bytes(vec![empty[1]]))
            }),
        )
}

fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   Listen Address: {}", config.listen_addr);
            println!("   Shutdown Timeout: {}", humantime::format_duration(config.shutdown_timeout()));
            println!("   JSON Indented: {}", config.json_indented);
            println!("   Compression: {}", !config.disable_compression);
            println!("   Log Level: {}", config.logging.level);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
