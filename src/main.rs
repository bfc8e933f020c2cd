use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peercall::calls::{
    AutoDecision, CallController, CallControllerHandle, LoopbackEngineFactory, SilentAudioSource,
};
use peercall::callcore::CallState;
use peercall::transport::MemoryRelay;
use peercall::{CallControllerConfig, RejectPolicy};
use std::path::PathBuf;
use std::time::Duration;

// Two participants on an in-process relay calling each other.
//
// Usage:
//   cargo run                                  # call, hold for 3 s, hang up
//   cargo run -- --hold-secs 10                # hold longer
//   cargo run -- --decline                     # callee declines
//   cargo run -- --glare                       # both dial at once
//   cargo run -- --reject-policy always
//   cargo run -- --config call.json            # shared settings from JSON

#[derive(Parser, Debug)]
#[command(name = "peercall", version, about)]
struct Args {
    /// Identity of the participant placing the call.
    #[arg(long, default_value = "1001")]
    caller: String,

    /// Identity of the participant receiving the call.
    #[arg(long, default_value = "2002")]
    callee: String,

    /// Seconds to stay connected before hanging up.
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,

    /// Seconds a call may take to connect.
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = RejectPolicy::OnLocalTeardown)]
    reject_policy: RejectPolicy,

    /// JSON file with shared controller settings. Overrides the timeout and
    /// policy flags; identities still come from --caller and --callee.
    #[arg(long)]
    config: Option<PathBuf>,

    /// The callee declines instead of picking up.
    #[arg(long)]
    decline: bool,

    /// Both participants dial at the same moment.
    #[arg(long)]
    glare: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn base_config(args: &Args) -> anyhow::Result<CallControllerConfig> {
    match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CallControllerConfig::from_json(&json)
                .with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(CallControllerConfig {
            reject_policy: args.reject_policy,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            ..CallControllerConfig::default()
        }),
    }
}

fn config_for(id: &str, base: &CallControllerConfig) -> CallControllerConfig {
    CallControllerConfig {
        local_id: id.into(),
        ..base.clone()
    }
}

/// Prints one participant's call log as it happens.
fn follow_log(handle: &CallControllerHandle) {
    let id = handle.local_id().clone();
    let mut log = handle.event_bus().call_log.subscribe();
    tokio::spawn(async move {
        while let Ok(entry) = log.recv().await {
            match entry.generation {
                Some(generation) => info!("[{id}] {generation}: {}", entry.kind),
                None => info!("[{id}] {}", entry.kind),
            }
        }
    });
}

async fn wait_for_state(handle: &CallControllerHandle, state: CallState) -> anyhow::Result<()> {
    let mut view = handle.subscribe_view();
    view.wait_for(|view| view.state == state).await?;
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let base = base_config(&args)?;
    let relay = MemoryRelay::new();
    let (caller_seat, callee_seat) = relay.factories();

    let caller = CallController::builder(config_for(&args.caller, &base))
        .with_engine_factory(LoopbackEngineFactory::default())
        .with_audio_source(SilentAudioSource::new())
        .build(&caller_seat)
        .await?;

    let decision = if args.decline {
        AutoDecision::decline()
    } else {
        AutoDecision::accept()
    };
    let callee = CallController::builder(config_for(&args.callee, &base))
        .with_engine_factory(LoopbackEngineFactory::default())
        .with_audio_source(SilentAudioSource::new())
        .with_decider(decision)
        .build(&callee_seat)
        .await?;

    follow_log(&caller);
    follow_log(&callee);

    caller
        .subscribe_presence()
        .wait_for(|present| *present)
        .await?;
    info!("{} and {} are paired", args.caller, args.callee);

    let attempt = if args.glare {
        let (ours, theirs) = tokio::join!(caller.start_call(), callee.start_call());
        if let Err(e) = theirs {
            warn!("{} could not dial: {e}", args.callee);
        }
        ours?
    } else {
        caller.start_call().await?
    };

    let established = tokio::select! {
        result = attempt.established() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            caller.hang_up().await?;
            Ok(())
        }
    };

    match established {
        Ok(()) if caller.state() == CallState::Active => {
            caller
                .send_message(format!("hello from {}", args.caller))
                .await?;
            info!("Holding the call for {}s", args.hold_secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(args.hold_secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            caller.hang_up().await?;
            wait_for_state(&callee, CallState::Idle).await?;
        }
        Ok(()) => {}
        Err(e) => warn!("Call did not connect: {e}"),
    }

    caller.shutdown().await?;
    callee.shutdown().await?;
    Ok(())
}
