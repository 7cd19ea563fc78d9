mod store_commands;

use std::path::PathBuf;

use {
    clap::{Args, Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use switchboard_config::SwitchboardConfig;

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: presence and cross-instance routing gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to switchboard.{toml,yaml,json} discovery).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a gateway instance.
    Gateway(GatewayArgs),
    /// Publish a system message to a user through the routing fabric.
    Send {
        /// Receiving user.
        #[arg(long)]
        to: String,
        /// Message type (e.g. notification, quiz_ready).
        #[arg(long = "type", default_value = "notification")]
        kind: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
        #[command(flatten)]
        redis: RedisArgs,
    },
    /// Show where a user is connected.
    Presence {
        user: String,
        #[command(flatten)]
        redis: RedisArgs,
    },
}

#[derive(Args)]
struct GatewayArgs {
    #[arg(long, env = "SWITCHBOARD_BIND")]
    bind: Option<String>,
    #[arg(long, env = "WSS_PORT")]
    port: Option<u16>,
    /// Stable instance id (defaults to a fresh UUID per process).
    #[arg(long, env = "SERVER_ID")]
    instance_id: Option<String>,
    #[command(flatten)]
    redis: RedisArgs,
}

#[derive(Args)]
struct RedisArgs {
    #[arg(long, env = "REDIS_URI")]
    redis_url: Option<String>,
}

impl GatewayArgs {
    fn apply(self, config: &mut SwitchboardConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(id) = self.instance_id {
            config.server.instance_id = Some(id);
        }
        self.redis.apply(config);
    }
}

impl RedisArgs {
    fn apply(self, config: &mut SwitchboardConfig) {
        if let Some(url) = self.redis_url {
            config.redis.url = url;
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = switchboard_config::load_or_discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway(args) => {
            info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");
            args.apply(&mut config);
            switchboard_gateway::server::start_gateway(config).await
        },
        Commands::Send {
            to,
            kind,
            payload,
            redis,
        } => {
            redis.apply(&mut config);
            store_commands::send(&config, &to, &kind, &payload).await
        },
        Commands::Presence { user, redis } => {
            redis.apply(&mut config);
            store_commands::presence(&config, &user).await
        },
    }
}
