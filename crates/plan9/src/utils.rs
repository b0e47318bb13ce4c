use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! proto_err {
    ($($arg:tt)*) => {
        $crate::error::Error::Protocol(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split an address of the form `network!netaddr!service` or `network!netaddr`.
///
/// A bare `netaddr` is taken to be a tcp address.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, Option<&str>)> {
    let mut split = arg.split('!');
    let first = split.next().filter(|s| !s.is_empty())?;
    let Some(addr) = split.next() else {
        return Some(("tcp", first, None));
    };
    let service = split.next();
    if addr.is_empty() || split.next().is_some() {
        return None;
    }

    Some((first, addr, service))
}

#[cfg(test)]
mod tests {
    use super::parse_proto;

    #[test]
    fn parse_full_address() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1", Some("564")))
        );
        assert_eq!(
            parse_proto("unix!/tmp/ns.glenda/acme"),
            Some(("unix", "/tmp/ns.glenda/acme", None))
        );
        assert_eq!(
            parse_proto("sources.cs.bell-labs.com"),
            Some(("tcp", "sources.cs.bell-labs.com", None))
        );
    }

    #[test]
    fn parse_rejects_junk() {
        assert_eq!(parse_proto(""), None);
        assert_eq!(parse_proto("tcp!"), None);
        assert_eq!(parse_proto("tcp!a!b!c"), None);
    }
}
