mod session;

use beam_pipe::secret::DEFAULT_WORDS;
use beam_pipe::{Beam, BeamConfig, Role, SharedSecret, Swarm, SwarmConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "beam",
    version,
    about = "A 1-to-1 end-to-end encrypted pipe between two machines",
    after_help = "Run without a passphrase to create one, then run `beam <passphrase>` on the other machine."
)]
struct Cli {
    /// Passphrase printed by the other side. Omit to generate a new one.
    passphrase: Vec<String>,

    /// Restart the waiting side with an existing passphrase.
    #[arg(short, long, requires = "passphrase")]
    restart: bool,

    /// Preferred TCP port (default: 49737, or BEAM_PORT).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn phrase(&self) -> Option<String> {
        (!self.passphrase.is_empty()).then(|| self.passphrase.join(" "))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Validate before the DHT client exists.
    let (secret, role) = match cli.phrase() {
        None => (SharedSecret::generate(DEFAULT_WORDS), Role::Responder),
        Some(phrase) => match SharedSecret::parse(&phrase) {
            Ok(secret) if cli.restart => (secret, Role::Responder),
            Ok(secret) => (secret, Role::Initiator),
            Err(e) => {
                eprintln!("[beam] {e}");
                eprintln!("[beam] hint: run `beam` without arguments to generate a passphrase");
                std::process::exit(1);
            }
        },
    };

    match (role, cli.restart) {
        (Role::Responder, false) => {
            eprintln!("[beam] Generated passphrase:");
            eprintln!();
            eprintln!("    {secret}");
            eprintln!();
            eprintln!("[beam] To connect to this pipe, on another machine run:");
            eprintln!();
            eprintln!("    beam {secret}");
            eprintln!();
        }
        (Role::Responder, true) => eprintln!("[beam] Restarting the waiting side with the given passphrase"),
        (Role::Initiator, _) => eprintln!("[beam] Connecting pipe..."),
    }

    let mut swarm_config = SwarmConfig::new();
    if let Some(port) = cli.port {
        swarm_config = swarm_config.preferred_port(port);
    }
    let swarm = Swarm::new(swarm_config)?;
    let beam = Beam::new(swarm, secret, role, BeamConfig::new())?;

    let code = session::run(beam).await?;
    // stdin may still be parked on a blocking read.
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_means_generate() {
        let cli = Cli::try_parse_from(["beam"]).unwrap();
        assert_eq!(cli.phrase(), None);
        assert!(!cli.restart);
    }

    #[test]
    fn words_are_joined_into_one_phrase() {
        let cli = Cli::try_parse_from(["beam", "correct", "horse", "battery", "staple"]).unwrap();
        assert_eq!(cli.phrase().as_deref(), Some("correct horse battery staple"));
    }

    #[test]
    fn restart_needs_a_passphrase() {
        assert!(Cli::try_parse_from(["beam", "-r"]).is_err());
        let cli = Cli::try_parse_from(["beam", "-r", "correct", "horse", "battery", "staple"]).unwrap();
        assert!(cli.restart);
    }

    #[test]
    fn port_override() {
        let cli = Cli::try_parse_from(["beam", "--port", "0"]).unwrap();
        assert_eq!(cli.port, Some(0));
    }
}
