//! Connecting to 9P servers.
//!
//! Addresses follow the Plan 9 `network!netaddr!service` convention:
//! `tcp!sources.cs.bell-labs.com!564`, `unix!/tmp/ns.glenda.:0/acme`.

use {
    crate::{
        conn::{Config, Conn},
        fcall::P9_PORT,
        fsys::Fsys,
        utils::{Result, parse_proto},
    },
    log::info,
    nix::unistd::{Uid, User},
    std::io,
    tokio::net::{TcpStream, UnixStream},
};

fn bad_address(addr: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("bad address: {:?}", addr),
    )
}

/// Connect to `addr` on `network` (`tcp`, `tcp4`, `tcp6` or `unix`) and
/// negotiate a session.
pub async fn dial(network: &str, addr: &str) -> Result<Conn> {
    dial_config(network, addr, Config::default()).await
}

/// [`dial`], negotiating the session with `config`.
pub async fn dial_config(network: &str, addr: &str, config: Config) -> Result<Conn> {
    let conn = match network {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Conn::with_config(stream, config).await?
        }
        "unix" => Conn::with_config(UnixStream::connect(addr).await?, config).await?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network: {}", network),
            )
            .into());
        }
    };
    info!("dialed {}!{}", network, addr);
    Ok(conn)
}

/// Split a `network!netaddr!service` string into the arguments of [`dial`].
///
/// tcp addresses without a service use port 564, as does the `9fs` service.
pub fn dial_args(addr: &str) -> Result<(String, String)> {
    let (network, host, service) = parse_proto(addr).ok_or_else(|| bad_address(addr))?;
    if network == "unix" {
        if service.is_some() {
            return Err(bad_address(addr).into());
        }
        return Ok((network.to_owned(), host.to_owned()));
    }

    let port = match service {
        None | Some("9fs") | Some("9pfs") => P9_PORT,
        Some(port) => port.parse::<u16>().map_err(|_| bad_address(addr))?,
    };
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_owned()
    };
    Ok((network.to_owned(), format!("{}:{}", host, port)))
}

/// [`dial`] with a single `network!netaddr!service` address.
pub async fn dial_addr(addr: &str) -> Result<Conn> {
    let (network, addr) = dial_args(addr)?;
    dial(&network, &addr).await
}

/// Name of the user running this process.
pub fn getuser() -> String {
    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| "none".to_owned()),
    }
}

/// Dial and attach to the server's default tree as the current user.
///
/// The connection is closed again if the attach fails.
pub async fn mount(network: &str, addr: &str) -> Result<Fsys> {
    let conn = dial(network, addr).await?;
    match conn.attach(None, &getuser(), "").await {
        Ok(fsys) => Ok(fsys),
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_defaults_to_9fs_port() {
        assert_eq!(
            dial_args("tcp!localhost").unwrap(),
            ("tcp".to_owned(), "localhost:564".to_owned())
        );
        assert_eq!(
            dial_args("tcp!10.0.0.1!9fs").unwrap(),
            ("tcp".to_owned(), "10.0.0.1:564".to_owned())
        );
        assert_eq!(
            dial_args("tcp!::1!5640").unwrap(),
            ("tcp".to_owned(), "[::1]:5640".to_owned())
        );
        assert_eq!(
            dial_args("plan9.io").unwrap(),
            ("tcp".to_owned(), "plan9.io:564".to_owned())
        );
    }

    #[test]
    fn unix_paths_pass_through() {
        assert_eq!(
            dial_args("unix!/tmp/ns.glenda.:0/acme").unwrap(),
            ("unix".to_owned(), "/tmp/ns.glenda.:0/acme".to_owned())
        );
        assert!(dial_args("unix!/tmp/sock!1").is_err());
    }

    #[test]
    fn bad_service_is_rejected() {
        assert!(dial_args("tcp!host!http").is_err());
        assert!(dial_args("tcp!host!99999").is_err());
        assert!(dial_args("").is_err());
    }

    #[tokio::test]
    async fn unknown_network() {
        assert!(dial("udp", "localhost:564").await.is_err());
    }
}
