//! Parsing gossip members into server descriptions.

use std::collections::HashMap;

use crate::config::ROLE_TAG;
use crate::gossip::Member;

/// The server-describing tags of a cluster member.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerParts {
    pub id: String,
    pub name: String,
    pub region: String,
    pub datacenter: String,
    pub rpc_addr: String,
    pub bootstrap: bool,
    pub expect: u64,
    pub version: String,
}

/// Whether the member is a consensus-eligible peer server, and its parts.
pub fn is_server(member: &Member) -> Option<ServerParts> {
    let tags = &member.tags;
    if tags.get("role").map(String::as_str) != Some(ROLE_TAG) {
        return None;
    }
    if tags.get("server").map(String::as_str) != Some("true") {
        return None;
    }

    let rpc_addr = tags
        .get("rpc_addr")
        .cloned()
        .unwrap_or_else(|| format!("{}:{}", member.addr, member.port));

    Some(ServerParts {
        id: member.name.clone(),
        name: member.name.clone(),
        region: tags.get("region").cloned().unwrap_or_default(),
        datacenter: tags.get("dc").cloned().unwrap_or_default(),
        rpc_addr,
        bootstrap: tags.get("bootstrap").map(String::as_str) == Some("1"),
        expect: tags
            .get("expect")
            .and_then(|e| e.parse().ok())
            .unwrap_or(0),
        version: tags.get("version").cloned().unwrap_or_default(),
    })
}

/// The reserved tag set an agent advertises about itself.
pub fn build_reserved_tags(
    config: &crate::config::Config,
    version: &str,
) -> HashMap<String, String> {
    let mut tags = config.tags.clone();
    tags.insert("role".to_string(), ROLE_TAG.to_string());
    tags.insert("version".to_string(), version.to_string());
    tags.insert("dc".to_string(), config.datacenter.clone());
    tags.insert("region".to_string(), config.region.clone());
    tags.insert("port".to_string(), config.gossip_port.to_string());
    tags.insert(
        "rpc_addr".to_string(),
        config.advertise_rpc_addr().to_string(),
    );
    if config.server {
        tags.insert("server".to_string(), "true".to_string());
        if config.effective_bootstrap() {
            tags.insert("bootstrap".to_string(), "1".to_string());
        }
        if config.bootstrap_expect > 0 {
            tags.insert("expect".to_string(), config.bootstrap_expect.to_string());
        }
    }
    tags
}

/// Tag names the agent never lets a tag update overwrite.
pub const RESERVED_TAGS: &[&str] = &[
    "role",
    "version",
    "server",
    "bootstrap",
    "expect",
    "port",
    "rpc_addr",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::MemberStatus;

    fn member(tags: &[(&str, &str)]) -> Member {
        Member {
            name: "n1".into(),
            addr: "10.0.0.1".parse().unwrap(),
            port: 8946,
            status: MemberStatus::Alive,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_is_server_requires_role_and_server_tags() {
        assert!(is_server(&member(&[])).is_none());
        assert!(is_server(&member(&[("role", "cronmesh")])).is_none());
        assert!(is_server(&member(&[("role", "other"), ("server", "true")])).is_none());

        let parts = is_server(&member(&[
            ("role", "cronmesh"),
            ("server", "true"),
            ("region", "global"),
            ("rpc_addr", "10.0.0.1:6868"),
            ("bootstrap", "1"),
            ("expect", "3"),
        ]))
        .unwrap();
        assert_eq!(parts.rpc_addr, "10.0.0.1:6868");
        assert_eq!(parts.region, "global");
        assert!(parts.bootstrap);
        assert_eq!(parts.expect, 3);
    }

    #[test]
    fn test_rpc_addr_falls_back_to_member_address() {
        let parts = is_server(&member(&[("role", "cronmesh"), ("server", "true")])).unwrap();
        assert_eq!(parts.rpc_addr, "10.0.0.1:8946");
    }

    #[test]
    fn test_build_reserved_tags() {
        let mut config = crate::config::Config::default();
        config.server = true;
        config.bootstrap = true;
        config.tags.insert("team".into(), "core".into());

        let tags = build_reserved_tags(&config, "0.1.0");
        assert_eq!(tags.get("role").unwrap(), "cronmesh");
        assert_eq!(tags.get("server").unwrap(), "true");
        assert_eq!(tags.get("bootstrap").unwrap(), "1");
        assert_eq!(tags.get("team").unwrap(), "core");
        assert!(tags.contains_key("rpc_addr"));
    }
}
