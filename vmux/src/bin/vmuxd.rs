//! vmuxd: stream-multiplexing proxy daemon.
//!
//! Runs on both sides of a vsock link. The host side listens for the guest
//! proxy; the guest side connects out to the host. Either side may expose
//! local Unix-domain listeners whose accepted connections become multiplexed
//! conversations, and inbound `Open` cookies are resolved as Unix socket
//! paths to connect.

// Standalone daemon; stderr is the correct diagnostic channel.
#![allow(clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("[vmuxd] vsock transport requires Linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    if let Err(e) = daemon::run() {
        eprintln!("[vmuxd] {e}");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
mod daemon {
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixListener;

    use clap::{Parser, Subcommand};
    use vmux::stream::FramedStream;
    use vmux::{EndpointKind, FdRegistry, Muxer, MuxerHandle, Role, UnixConnector};
    use vmux_proto::PROXY_PORT;

    #[derive(Parser)]
    #[command(name = "vmuxd", version, about = "Stream-multiplexing proxy over vsock")]
    struct Cli {
        #[command(subcommand)]
        command: Command,

        /// Local Unix listeners to expose, as `<socket-path>:<cookie>`.
        ///
        /// Every connection accepted on the path opens a conversation whose
        /// peer endpoint is resolved from the cookie.
        #[arg(long = "expose", value_name = "PATH:COOKIE", global = true)]
        expose: Vec<String>,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Listen on a vsock port and serve the first peer that connects.
        Host {
            /// Vsock port to bind.
            #[arg(long, default_value_t = PROXY_PORT)]
            port: u32,
        },
        /// Connect to the host side.
        Guest {
            /// Context id of the peer (defaults to the host CID).
            #[arg(long, default_value_t = vmux::vsock::HOST_CID)]
            cid: u32,
            /// Vsock port to connect.
            #[arg(long, default_value_t = PROXY_PORT)]
            port: u32,
        },
    }

    pub fn run() -> vmux::Result<()> {
        let cli = Cli::parse();

        let (transport, role) = match cli.command {
            Command::Host { port } => {
                let listener = vmux::vsock::listen(port)?;
                eprintln!("[vmuxd] listening on vsock port {port}");
                let conn = vmux::vsock::accept(&listener)?;
                (FramedStream::new(conn)?, Role::Acceptor)
            }
            Command::Guest { cid, port } => {
                let conn = vmux::vsock::connect(cid, port)?;
                eprintln!("[vmuxd] connected to cid {cid} port {port}");
                (FramedStream::new(conn)?, Role::Initiator)
            }
        };

        let muxer = Muxer::new(
            transport,
            role,
            Box::new(UnixConnector),
            FdRegistry::new(),
        )?;
        let control = muxer.control();

        for spec in &cli.expose {
            let Some((path, cookie)) = spec.split_once(':') else {
                eprintln!("[vmuxd] ignoring malformed --expose {spec:?}");
                continue;
            };
            spawn_exposer(path.to_string(), cookie.to_string(), control.clone())?;
        }

        muxer.run()
    }

    /// Accepts connections on a local Unix listener and opens one
    /// conversation per connection.
    fn spawn_exposer(path: String, cookie: String, control: MuxerHandle) -> vmux::Result<()> {
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        eprintln!("[vmuxd] exposing {path} as {cookie:?}");

        std::thread::spawn(move || {
            loop {
                match listener.accept() {
                    Ok((conn, _)) => {
                        if control
                            .open(OwnedFd::from(conn), EndpointKind::Socket, cookie.clone())
                            .is_err()
                        {
                            // The muxer is gone; stop accepting.
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("[vmuxd] accept on {path} failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}
