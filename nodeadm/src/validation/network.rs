//! Node IP resolution and network reachability checks.
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use hybrid_api::cluster::RemoteNodeNetwork;
use hybrid_api::node_config::NodeConfig;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::layout::HostLayout;
use crate::remediation::with_remediation;

pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);
const ROUTE_TABLE_PATH: &str = "/proc/net/route";

/// What the node IP resolution needs to know about the host network.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>>;
    /// IPv4 address of the interface holding the default route.
    fn default_route_address(&self) -> anyhow::Result<IpAddr>;
    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>>;
}

pub struct SystemNetwork {
    route_table: PathBuf,
}

impl SystemNetwork {
    pub fn new(layout: &HostLayout) -> Self {
        Self {
            route_table: layout.resolve(ROUTE_TABLE_PATH),
        }
    }

    fn interface_addresses(&self) -> anyhow::Result<Vec<(String, IpAddr)>> {
        let mut addresses = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs().context("listing interface addresses")? {
            let Some(address) = ifaddr.address else { continue };
            if let Some(v4) = address.as_sockaddr_in() {
                addresses.push((ifaddr.interface_name, IpAddr::V4(v4.ip())));
            } else if let Some(v6) = address.as_sockaddr_in6() {
                addresses.push((ifaddr.interface_name, IpAddr::V6(v6.ip())));
            }
        }
        Ok(addresses)
    }
}

#[async_trait]
impl HostNetwork for SystemNetwork {
    fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        Ok(self
            .interface_addresses()?
            .into_iter()
            .map(|(_, ip)| ip)
            .collect())
    }

    fn default_route_address(&self) -> anyhow::Result<IpAddr> {
        let table = std::fs::read_to_string(&self.route_table)
            .with_context(|| format!("reading {}", self.route_table.display()))?;
        let iface = default_route_interface(&table).context("no default route found")?;
        self.interface_addresses()?
            .into_iter()
            .find(|(name, ip)| name == iface && ip.is_ipv4() && is_usable(ip))
            .map(|(_, ip)| ip)
            .with_context(|| format!("no IPv4 address on default route interface {iface}"))
    }

    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("resolving {host}"))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Interface of the first default route in `/proc/net/route` format.
pub fn default_route_interface(table: &str) -> Option<&str> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [iface, "00000000", _gateway, ..] => Some(*iface),
            _ => None,
        }
    })
}

fn is_usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_multicast() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified()),
    }
}

/// Resolves the IP the kubelet will register with:
///
/// 1. `--node-ip` when it holds a specified IPv4 address (dual-stack
///    values list one address per family),
/// 2. for IAM Roles Anywhere, the first usable local IPv4 address the node
///    name resolves to,
/// 3. the address of the default route interface.
pub async fn resolve_node_ip(config: &NodeConfig, network: &dyn HostNetwork) -> anyhow::Result<IpAddr> {
    if let Some(flag) = config.kubelet_flag("node-ip") {
        if let Some(ip) = node_ip_from_flag(flag) {
            debug!("using node IP {ip} from kubelet flags");
            return Ok(ip);
        }
    }

    if let Some(iam) = config.iam_roles_anywhere() {
        if !iam.node_name.is_empty() {
            if let Some(ip) = resolve_by_name(&iam.node_name, network).await? {
                debug!("using node IP {ip} resolved from node name {}", iam.node_name);
                return Ok(ip);
            }
        }
    }

    network.default_route_address()
}

fn node_ip_from_flag(flag: &str) -> Option<IpAddr> {
    flag.split(',')
        .map(str::trim)
        .filter_map(|value| match value.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("ignoring unparsable --node-ip value {value:?}");
                None
            }
        })
        .find(|ip| ip.is_ipv4() && !ip.is_unspecified())
}

async fn resolve_by_name(name: &str, network: &dyn HostNetwork) -> anyhow::Result<Option<IpAddr>> {
    let resolved = match network.lookup(name).await {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!("node name {name} does not resolve: {e:#}");
            return Ok(None);
        }
    };
    let local = network.local_addresses()?;
    Ok(resolved
        .into_iter()
        .find(|ip| ip.is_ipv4() && is_usable(ip) && local.contains(ip)))
}

/// Checks that `ip` is inside one of the remote node networks. Networks
/// and their CIDRs are tried in order.
pub fn validate_ip_in_remote_node_networks(
    ip: IpAddr,
    networks: &[RemoteNodeNetwork],
) -> anyhow::Result<()> {
    if networks.is_empty() {
        return Err(with_remediation(
            anyhow!("cluster has no remote node networks configured"),
            "Configure remoteNetworkConfig.remoteNodeNetworks on the EKS cluster with the CIDRs your hybrid nodes use.",
        ));
    }
    let mut checked = Vec::new();
    for network in networks {
        for cidr in &network.cidrs {
            let net: IpNet = cidr
                .parse()
                .with_context(|| format!("invalid remote node network CIDR {cidr:?}"))?;
            if net.contains(&ip) {
                info!("node IP {ip} is in remote node network {cidr}");
                return Ok(());
            }
            checked.push(cidr.as_str());
        }
    }
    Err(with_remediation(
        anyhow!(
            "node IP {ip} is not in any of the remote network CIDR blocks [{}]",
            checked.join(", ")
        ),
        "Ensure the node IP is inside one of the cluster's remote node networks, or set --node-ip in the kubelet flags to such an address.",
    ))
}

/// Resolves the API server host and opens a TCP connection to it.
pub async fn check_endpoint_reachable(endpoint: &str, timeout: Duration) -> anyhow::Result<()> {
    let url = url::Url::parse(endpoint)
        .with_context(|| format!("invalid API server endpoint {endpoint:?}"))?;
    let Some(host) = url.host_str() else {
        bail!("API server endpoint {endpoint:?} has no host");
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let connect = tokio::net::TcpStream::connect((host, port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(with_remediation(
            anyhow::Error::new(e).context(format!("connecting to {host}:{port}")),
            "Ensure DNS resolves the API server endpoint and the node can reach it on port 443.",
        )),
        Err(_) => Err(with_remediation(
            anyhow!("timed out connecting to {host}:{port}"),
            "Ensure firewalls allow outbound traffic from the node to the API server on port 443.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use hybrid_api::node_config::{HybridOptions, IamRolesAnywhere};

    use super::*;
    use crate::remediation::remediation;

    fn networks(cidrs: &[&[&str]]) -> Vec<RemoteNodeNetwork> {
        cidrs
            .iter()
            .map(|c| RemoteNodeNetwork {
                cidrs: c.iter().map(|s| s.to_string()).collect(),
            })
            .collect()
    }

    #[test]
    fn ip_in_remote_node_networks() {
        let single = networks(&[&["10.0.0.0/24"]]);
        validate_ip_in_remote_node_networks("10.0.0.3".parse().unwrap(), &single).unwrap();

        let err = validate_ip_in_remote_node_networks("192.168.1.1".parse().unwrap(), &single)
            .unwrap_err();
        assert!(err.to_string().contains("[10.0.0.0/24]"));
        assert!(remediation(&err).is_some());

        let multi = networks(&[&["10.1.0.0/16", "192.1.0.0/24"]]);
        validate_ip_in_remote_node_networks("192.1.0.20".parse().unwrap(), &multi).unwrap();

        let err = validate_ip_in_remote_node_networks(
            "172.16.0.1".parse().unwrap(),
            &networks(&[&["10.1.0.0/16"], &["192.1.0.0/24"]]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("[10.1.0.0/16, 192.1.0.0/24]"));

        assert!(validate_ip_in_remote_node_networks("10.0.0.3".parse().unwrap(), &[]).is_err());
    }

    struct FakeNetwork {
        local: Vec<IpAddr>,
        default: IpAddr,
        resolved: Vec<IpAddr>,
    }

    #[async_trait]
    impl HostNetwork for FakeNetwork {
        fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
            Ok(self.local.clone())
        }
        fn default_route_address(&self) -> anyhow::Result<IpAddr> {
            Ok(self.default)
        }
        async fn lookup(&self, _host: &str) -> anyhow::Result<Vec<IpAddr>> {
            Ok(self.resolved.clone())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn node_ip_resolution_order() {
        let network = FakeNetwork {
            local: vec![ip("127.0.0.1"), ip("10.0.0.7"), ip("10.0.0.8")],
            default: ip("10.0.0.8"),
            resolved: vec![ip("127.0.0.1"), ip("203.0.113.9"), ip("10.0.0.7")],
        };

        let mut config = NodeConfig::default();
        assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.8"));

        config.spec.hybrid = Some(HybridOptions {
            iam_roles_anywhere: Some(IamRolesAnywhere {
                node_name: "node-1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        // loopback and non-local results are passed over
        assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.7"));

        config.spec.kubelet.flags = vec!["--node-ip=0.0.0.0".to_string()];
        assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.7"));

        config.spec.kubelet.flags.push("--node-ip=10.0.0.3".to_string());
        assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.3"));
    }

    #[tokio::test]
    async fn node_ip_flag_without_usable_ipv4_falls_through() {
        let network = FakeNetwork {
            local: vec![ip("10.0.0.8")],
            default: ip("10.0.0.8"),
            resolved: vec![],
        };
        let mut config = NodeConfig::default();

        for flag in ["--node-ip=not-an-ip", "--node-ip=fd00::1", "--node-ip=garbage,fd00::1"] {
            config.spec.kubelet.flags = vec![flag.to_string()];
            assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.8"), "{flag}");
        }

        config.spec.kubelet.flags = vec!["--node-ip=fd00::1,10.0.0.4".to_string()];
        assert_eq!(resolve_node_ip(&config, &network).await.unwrap(), ip("10.0.0.4"));
    }

    #[test]
    fn default_route_from_proc() {
        let table = "Iface\tDestination\tGateway\tFlags\n\
                     eth1\t0000A8C0\t00000000\t0001\n\
                     eth0\t00000000\t0100A8C0\t0003\n";
        assert_eq!(default_route_interface(table), Some("eth0"));
        assert_eq!(default_route_interface("Iface\tDestination\n"), None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_has_remediation() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        check_endpoint_reachable(&format!("https://127.0.0.1:{port}"), ENDPOINT_TIMEOUT)
            .await
            .unwrap();
        drop(listener);

        let err = check_endpoint_reachable(&format!("https://127.0.0.1:{port}"), ENDPOINT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(remediation(&err).is_some());
        assert!(check_endpoint_reachable("not a url", ENDPOINT_TIMEOUT).await.is_err());
    }
}
