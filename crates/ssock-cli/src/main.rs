use clap::{ArgAction, Parser, Subcommand};
use ssock_stream::identity::container::DEFAULT_ITERATIONS;
use ssock_stream::socket::AddressFamily;
use tracing_subscriber::EnvFilter;

mod mkcert;
mod s_client;
mod s_server;

/// Secure-stream command-line tool.
#[derive(Parser)]
#[command(name = "ssock")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log verbosity: -v for debug, -vv for trace. RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a certificate and sealed credential container.
    Mkcert {
        /// Certificate subject (the name clients will ask for).
        subject: String,
        /// Output container file.
        #[arg(short, long)]
        output: String,
        /// Passphrase sealing the output container.
        #[arg(long)]
        pass: String,
        /// Create a CA certificate.
        #[arg(long)]
        ca: bool,
        /// Container holding the issuing CA; self-signed when omitted.
        #[arg(long)]
        issuer: Option<String>,
        /// Passphrase of the issuer container (defaults to --pass).
        #[arg(long)]
        issuer_pass: Option<String>,
        /// Also write the certificate as PEM, for use with --CAfile.
        #[arg(long)]
        cert_out: Option<String>,
        /// PBKDF2 iteration count for sealing.
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
    },
    /// Secure-stream client.
    SClient {
        /// Host:port to connect to (default port 4433).
        connect: String,
        /// Trusted CA or pinned server certificates (PEM).
        #[arg(long = "CAfile")]
        ca_file: Option<String>,
        /// Client identity container.
        #[arg(long)]
        identity: Option<String>,
        /// Passphrase of the identity container.
        #[arg(long)]
        pass: Option<String>,
        /// Fail when the server identity cannot be verified.
        #[arg(long)]
        strict: bool,
        /// Use IPv6.
        #[arg(short = '6', long)]
        ipv6: bool,
        /// Send this message, print the reply and exit.
        #[arg(short, long)]
        message: Option<String>,
        /// Quiet mode: suppress connection info.
        #[arg(long, short)]
        quiet: bool,
    },
    /// Secure-stream echo server.
    SServer {
        /// Port to listen on.
        #[arg(short, long, default_value = "4433")]
        port: u16,
        /// Server identity container.
        #[arg(long)]
        identity: String,
        /// Passphrase of the identity container.
        #[arg(long)]
        pass: String,
        /// Use IPv6.
        #[arg(short = '6', long)]
        ipv6: bool,
        /// Exit after the first connection.
        #[arg(long)]
        once: bool,
        /// Quiet mode: suppress connection info.
        #[arg(long, short)]
        quiet: bool,
    },
}

fn family(ipv6: bool) -> AddressFamily {
    if ipv6 {
        AddressFamily::Ipv6
    } else {
        AddressFamily::Ipv4
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Commands::Mkcert {
            subject,
            output,
            pass,
            ca,
            issuer,
            issuer_pass,
            cert_out,
            iterations,
        } => mkcert::run(&mkcert::MkcertOptions {
            subject,
            output,
            pass,
            ca: *ca,
            issuer: issuer.as_deref(),
            issuer_pass: issuer_pass.as_deref(),
            cert_out: cert_out.as_deref(),
            iterations: *iterations,
        }),
        Commands::SClient {
            connect,
            ca_file,
            identity,
            pass,
            strict,
            ipv6,
            message,
            quiet,
        } => s_client::run(&s_client::ClientOptions {
            connect,
            family: family(*ipv6),
            ca_file: ca_file.as_deref(),
            identity: identity.as_deref(),
            pass: pass.as_deref(),
            strict: *strict,
            message: message.as_deref(),
            quiet: *quiet,
        }),
        Commands::SServer {
            port,
            identity,
            pass,
            ipv6,
            once,
            quiet,
        } => s_server::run(&s_server::ServerOptions {
            port: *port,
            family: family(*ipv6),
            identity,
            pass,
            once: *once,
            quiet: *quiet,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
