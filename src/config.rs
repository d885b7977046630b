use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;

#[cfg(feature = "bin")]
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";

#[cfg(feature = "bin")]
const AFTER_HELP: &str = "\
Tunnels all TCP connections redirected by the local Linux iptables firewall
to <LISTEN_PORT> via the HTTP proxy <PROXY_HOST>, which has to support the
HTTPS/SSL CONNECT method.

Use
  # iptables -t nat -A OUTPUT -p tcp ! -d <PROXY_HOST> \\
        -j REDIRECT --to-port <LISTEN_PORT>
or a similar rule to configure the firewall.";

#[derive(Clone, Debug)]
pub struct Config {
    /// The upstream HTTP proxy every connection is tunnelled through.
    pub proxy: ProxyTarget,
    /// Host name or IPv4 address to listen on.
    pub listen_host: String,
    /// Port the firewall redirects connections to.
    pub listen_port: u16,
    /// Bound on dialing the proxy and completing the CONNECT handshake. `None` waits forever.
    pub setup_timeout: Option<Duration>,
    /// Reject proxy replies whose status is not 2xx.
    pub require_success: bool,
    /// What the listener does when `accept` fails.
    pub accept_policy: AcceptPolicy,
    /// Log filter, in `env_logger` syntax.
    pub log: String,
}

impl Config {
    /// Creates a config with the reference defaults: no timeouts, no status
    /// validation, and an accept loop that stops on the first error.
    pub fn new(proxy: ProxyTarget, listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            proxy,
            listen_host: listen_host.into(),
            listen_port,
            setup_timeout: None,
            require_success: false,
            accept_policy: AcceptPolicy::FailFast,
            log: "info".into(),
        }
    }

    /// Resolves the listen host to the IPv4 socket address to bind.
    pub async fn listen_addr(&self) -> anyhow::Result<SocketAddrV4> {
        resolve_ipv4(&self.listen_host, self.listen_port)
            .await
            .with_context(|| format!("Failed to resolve listen address {}", self.listen_host))
    }

    #[cfg(feature = "bin")]
    pub fn from_args() -> anyhow::Result<Self> {
        let matches = command().get_matches();
        Self::from_matches(&matches)
    }

    /// Parses the given command line. Unlike [`Config::from_args`], usage errors are returned
    /// instead of terminating the process.
    #[cfg(feature = "bin")]
    pub fn try_from_iter<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command()
            .try_get_matches_from(args)
            .with_context(|| "Invalid arguments")?;
        Self::from_matches(&matches)
    }

    #[cfg(feature = "bin")]
    fn from_matches(matches: &clap::ArgMatches) -> anyhow::Result<Self> {
        let args: Vec<&str> = matches
            .get_many::<String>("ARGS")
            .with_context(|| "Missing listen port")?
            .map(String::as_str)
            .collect();

        // Positional proxy arguments win; the options (or their env vars) fill in otherwise.
        let (proxy_host, proxy_port, listen) = match (
            args.as_slice(),
            matches.get_one::<String>("proxy-host"),
            matches.get_one::<String>("proxy-port"),
        ) {
            ([host, port, listen @ ..], _, _) if !listen.is_empty() => {
                (host.to_string(), *port, listen)
            }
            (listen, Some(host), Some(port)) if listen.len() <= 2 => {
                (host.to_string(), port.as_str(), listen)
            }
            _ => anyhow::bail!("Expected <PROXY_HOST> <PROXY_PORT> [LISTEN_ADDR] <LISTEN_PORT>"),
        };

        let proxy = ProxyTarget {
            host: proxy_host,
            port: parse_port(Some(proxy_port)).with_context(|| "Invalid proxy port")?,
        };

        let (listen_host, listen_port) = match listen {
            [port] => (DEFAULT_LISTEN_ADDR.to_string(), *port),
            [host, port] => (host.to_string(), *port),
            _ => anyhow::bail!("Expected [LISTEN_ADDR] LISTEN_PORT"),
        };

        Ok(Self {
            proxy,
            listen_host,
            listen_port: parse_port(Some(listen_port)).with_context(|| "Invalid listen port")?,
            setup_timeout: parse_timeout(
                matches.get_one::<String>("setup-timeout").map(String::as_str),
            )
            .with_context(|| "Invalid setup timeout")?,
            require_success: matches.get_flag("require-success"),
            accept_policy: if matches.get_flag("keep-accepting") {
                AcceptPolicy::KeepAccepting
            } else {
                AcceptPolicy::FailFast
            },
            log: matches
                .get_one::<String>("log")
                .cloned()
                .unwrap_or_else(|| "info".into()),
        })
    }
}

#[cfg(feature = "bin")]
fn command() -> clap::Command {
    use clap::{Arg, ArgAction, Command};

    Command::new("redirproxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tunnels firewall-redirected TCP connections through an HTTP CONNECT proxy.")
        .override_usage(
            "redirproxy [OPTIONS] <PROXY_HOST> <PROXY_PORT> [LISTEN_ADDR] <LISTEN_PORT>\n       \
             redirproxy [OPTIONS] --proxy-host <HOST> --proxy-port <PORT> [LISTEN_ADDR] <LISTEN_PORT>",
        )
        .after_help(AFTER_HELP)
        .args([
            Arg::new("ARGS")
                .required(true)
                .num_args(1..=4)
                .value_name("ARG")
                .help("<PROXY_HOST> <PROXY_PORT> [LISTEN_ADDR] <LISTEN_PORT>. The proxy may instead be given with --proxy-host and --proxy-port. LISTEN_ADDR defaults to 0.0.0.0."),
            Arg::new("proxy-host")
                .long("proxy-host")
                .num_args(1)
                .env("REDIRPROXY_PROXY_HOST")
                .help("Host name or IPv4 address of the HTTP proxy, when not given positionally. Example: proxy.local"),
            Arg::new("proxy-port")
                .long("proxy-port")
                .num_args(1)
                .env("REDIRPROXY_PROXY_PORT")
                .help("Port of the HTTP proxy, when not given positionally. Example: 3128"),
            Arg::new("setup-timeout")
                .long("setup-timeout")
                .num_args(1)
                .env("REDIRPROXY_SETUP_TIMEOUT")
                .help("Gives up on a connection if dialing the proxy or the CONNECT handshake takes longer than this many seconds."),
            Arg::new("require-success")
                .long("require-success")
                .action(ArgAction::SetTrue)
                .env("REDIRPROXY_REQUIRE_SUCCESS")
                .help("Drops the connection unless the proxy answers CONNECT with a 2xx status."),
            Arg::new("keep-accepting")
                .long("keep-accepting")
                .action(ArgAction::SetTrue)
                .env("REDIRPROXY_KEEP_ACCEPTING")
                .help("Logs accept failures and keeps serving instead of exiting."),
            Arg::new("log")
                .long("log")
                .num_args(1)
                .env("REDIRPROXY_LOG")
                .default_value("info")
                .help("Configures the log level and format."),
        ])
}

/// Host and port of the upstream HTTP proxy, as given on the command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Looks up the proxy host once. The result is used for every connection afterwards.
    pub async fn resolve(&self) -> anyhow::Result<SocketAddrV4> {
        resolve_ipv4(&self.host, self.port)
            .await
            .with_context(|| format!("Failed to resolve proxy address {}", self))
    }
}

impl Display for ProxyTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Behaviour of the accept loop when accepting a client fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptPolicy {
    /// Stop serving and report the error.
    FailFast,
    /// Log the error and keep accepting.
    KeepAccepting,
}

/// Returns the first IPv4 address `host` resolves to.
async fn resolve_ipv4(host: &str, port: u16) -> anyhow::Result<SocketAddrV4> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Could not lookup {}", host))?
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("No IPv4 address found for {}", host))
}

fn parse_port(s: Option<&str>) -> anyhow::Result<u16> {
    s.with_context(|| "Missing port")?
        .parse::<u16>()
        .with_context(|| format!("Port must be a number between 0 and {}", u16::MAX))
}

fn parse_timeout(s: Option<&str>) -> anyhow::Result<Option<Duration>> {
    if let Some(s) = s {
        let seconds: u64 = s
            .parse()
            .with_context(|| "Timeout must be a whole number of seconds")?;
        anyhow::ensure!(seconds > 0, "Timeout must be at least one second");
        Ok(Some(Duration::from_secs(seconds)))
    } else {
        Ok(None)
    }
}
