use anyhow::Context;
use deskdrop::core::identity::IdentityProvider;
use deskdrop::utils::data_dir;
use deskdrop::utils::log_file::FileLogLayer;
use deskdrop::utils::sos::SignalOfStop;
use deskdrop::workers::args::{Args, Command};
use deskdrop::workers::demo;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Args::load()?;

    // Must happen before anything reads or writes persistent state.
    let data_dir = data_dir::init(settings.data_dir.as_deref())?;

    let filter = match settings.verbose {
        0 => "warn,deskdrop=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let log_path = data_dir.join("logs").join("deskdrop.log");
    let file_layer = FileLogLayer::new(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match settings.command {
        Command::Id { refresh } => {
            let identity = IdentityProvider::in_data_dir(data_dir);
            let current = identity.load_or_create();
            let id = if refresh {
                identity.regenerate(Some(&current))
            } else {
                current
            };
            println!("{id}");
        }
        Command::Demo { file, out } => {
            let path = demo::run(&file, &out, settings.session, sos).await?;
            println!("received copy written to {}", path.display());
        }
    }

    Ok(())
}
