//! Mapping configuration.
//!
//! Mappings come from a properties file where every key is
//! `<mapping name>.<parameter>`:
//!
//! ```text
//! web.localPort = 8080
//! web.remoteHost = 10.0.0.7
//! web.remotePort = 80
//! ```
//!
//! or from inline `NAME=LOCAL_PORT:HOST:REMOTE_PORT` specs on the command line.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use eyre::WrapErr;

use crate::mapping::Mapping;

pub const DEFAULT_FILE: &str = "proxy.properties";

const LOCAL_PORT: &str = "localPort";
const REMOTE_HOST: &str = "remoteHost";
const REMOTE_PORT: &str = "remotePort";

/// Reads and validates the mappings in a properties file.
pub fn load(path: impl AsRef<Path>) -> eyre::Result<Vec<Mapping>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config file {}", path.display()))?;
    Ok(validate(parse(&text)))
}

/// Collects mappings from properties text without validating them.
/// Problems with individual entries are logged and leave the field unset.
pub fn parse(text: &str) -> Vec<Mapping> {
    let mut mappings: BTreeMap<String, Mapping> = BTreeMap::new();

    for (line_no, line) in text.lines().enumerate() {
        let Some((key, value)) = property(line) else {
            continue;
        };
        let mut parts = key.split('.');
        let (Some(name), Some(parameter), None) = (parts.next(), parts.next(), parts.next()) else {
            tracing::debug!("line {}: ignoring key '{key}'", line_no + 1);
            continue;
        };

        let mapping = mappings
            .entry(name.to_string())
            .or_insert_with(|| Mapping::named(name));
        match parameter {
            LOCAL_PORT => mapping.set_local_port(port(key, value)),
            REMOTE_PORT => mapping.set_remote_port(port(key, value)),
            REMOTE_HOST => mapping.set_remote_host(value),
            _ => tracing::error!("Parameter {parameter} is not supported"),
        }
    }

    mappings.into_values().collect()
}

/// Parses an inline `NAME=LOCAL_PORT:HOST:REMOTE_PORT` mapping.
pub fn parse_inline(spec: &str) -> eyre::Result<Mapping> {
    let (name, target) = spec
        .split_once('=')
        .ok_or_else(|| eyre::eyre!("expected NAME=LOCAL_PORT:HOST:REMOTE_PORT"))?;
    let (local, rest) = target
        .split_once(':')
        .ok_or_else(|| eyre::eyre!("missing remote address after local port"))?;
    let (host, remote) = rest
        .rsplit_once(':')
        .ok_or_else(|| eyre::eyre!("missing remote port"))?;

    let name = name.trim();
    if name.is_empty() {
        eyre::bail!("mapping name is empty");
    }
    let local: u16 = local.trim().parse().wrap_err("local port")?;
    let remote: u16 = remote.trim().parse().wrap_err("remote port")?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');

    let mapping = Mapping::new(name, local, host, remote);
    if !mapping.is_configured() {
        eyre::bail!("mapping '{name}' needs non-zero ports and a remote host");
    }
    Ok(mapping)
}

/// Drops unconfigured mappings and mappings whose local port is already
/// taken by an earlier one.
pub fn validate(mappings: Vec<Mapping>) -> Vec<Mapping> {
    let mut taken: HashMap<u16, String> = HashMap::new();
    let mut accepted = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        let Some(local_port) = mapping.local_port().filter(|_| mapping.is_configured()) else {
            tracing::warn!("Mapping {mapping} is incomplete, skipped");
            continue;
        };
        if let Some(conflict) = taken.get(&local_port) {
            tracing::error!(
                "Mapping local port configuration '{conflict}' conflicts with '{}'. Mapping '{}' skipped.",
                mapping.name(),
                mapping.name()
            );
            continue;
        }
        taken.insert(local_port, mapping.name().to_string());
        accepted.push(mapping);
    }

    tracing::info!("{} mapping ports configured", accepted.len());
    accepted
}

/// Splits one properties line into key and value; `None` for blanks and
/// comments.
fn property(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    let split = line
        .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
        .unwrap_or(line.len());
    let key = &line[..split];
    let rest = line[split..].trim_start();
    let value = rest
        .strip_prefix('=')
        .or_else(|| rest.strip_prefix(':'))
        .unwrap_or(rest)
        .trim();
    Some((key, value))
}

fn port(key: &str, value: &str) -> Option<u16> {
    match value.parse::<u16>() {
        Ok(port) => Some(port),
        Err(e) => {
            tracing::error!("{key}: '{value}' is not a port number: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties() {
        let mappings = parse(
            "# forwarding rules\n\
             web.localPort=8080\n\
             web.remoteHost = 10.0.0.7\n\
             web.remotePort: 80\n\
             \n\
             ! ssh\n\
             ssh.localPort 2222\n\
             ssh.remoteHost\tgateway\n\
             ssh.remotePort = 22\n",
        );
        assert_eq!(mappings.len(), 2);

        let ssh = &mappings[0];
        assert_eq!(ssh.name(), "ssh");
        assert_eq!(ssh.local_port(), Some(2222));
        assert_eq!(ssh.remote_host(), Some("gateway"));
        assert_eq!(ssh.remote_port(), Some(22));

        let web = &mappings[1];
        assert_eq!(web.to_string(), "web (:8080 -> 10.0.0.7:80)");
    }

    #[test]
    fn bad_values_leave_fields_unset() {
        let mappings = parse(
            "a.localPort=eighty\n\
             a.remoteHost=host\n\
             a.remotePort=70000\n\
             a.timeout=5\n\
             stray=1\n\
             too.many.parts=1\n",
        );
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].local_port(), None);
        assert_eq!(mappings[0].remote_port(), None);
        assert!(!mappings[0].is_configured());
    }

    #[test]
    fn validate_rejects_incomplete_and_duplicate_ports() {
        let mappings = parse(
            "alpha.localPort=9000\n\
             alpha.remoteHost=one\n\
             alpha.remotePort=1\n\
             beta.localPort=9000\n\
             beta.remoteHost=two\n\
             beta.remotePort=2\n\
             gamma.localPort=9001\n\
             gamma.remoteHost=three\n\
             delta.localPort=9002\n\
             delta.remoteHost=four\n\
             delta.remotePort=4\n",
        );
        let names: Vec<_> = validate(mappings)
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, ["alpha", "delta"]);
    }

    #[test]
    fn inline_mapping() {
        let mapping = parse_inline("db=15432:db.internal:5432").unwrap();
        assert_eq!(mapping.to_string(), "db (:15432 -> db.internal:5432)");

        let v6 = parse_inline("v6=8080:[::1]:80").unwrap();
        assert_eq!(v6.remote_host(), Some("::1"));

        assert!(parse_inline("nohost=8080").is_err());
        assert!(parse_inline("=1:h:2").is_err());
        assert!(parse_inline("zero=0:h:2").is_err());
        assert!(parse_inline("x=1::2").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load("/nonexistent/tcp-forward.properties").unwrap_err();
        assert!(format!("{err}").contains("read config file"));
    }
}
