//! NAT port mapping, tried at engine startup for the TCP listen port, the
//! DHT port, and the UDP tracker port: NAT-PMP (RFC 6886) first, then UPnP
//! (SSDP discovery followed by a SOAP `AddPortMapping` on the gateway's
//! WANIPConnection service). Everything here is best effort: a failure is
//! logged by the caller and the engine runs unmapped.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time::timeout};
use url::Url;

use crate::error::*;

const NAT_PMP_PORT: u16 = 5351;
const NAT_PMP_TIMEOUT: Duration = Duration::from_millis(750);

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SSDP_TIMEOUT: Duration = Duration::from_secs(3);

/// The default lease requested for our mappings.
pub(crate) const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

/// Gateways commonly live at one of these when no hint is configured.
const GATEWAY_GUESSES: [Ipv4Addr; 4] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(192, 168, 178, 1),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn nat_pmp_opcode(self) -> u8 {
        match self {
            Self::Udp => 1,
            Self::Tcp => 2,
        }
    }

    fn upnp_name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// An established port mapping and when it should be renewed (halfway into
/// its lease).
#[derive(Clone, Copy, Debug)]
pub(crate) struct PortMapping {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub lease: Duration,
    pub renew_at: Instant,
}

/// How the gateway is talked to, decided once at discovery.
enum Gateway {
    NatPmp(Ipv4Addr),
    Upnp {
        control_url: Url,
        service_type: String,
    },
}

pub(crate) struct NatManager {
    gateway: Gateway,
    http: reqwest::Client,
    mappings: Vec<PortMapping>,
}

impl NatManager {
    /// Finds a reachable gateway: NAT-PMP at the hinted (or guessed)
    /// addresses first, UPnP discovery second.
    pub async fn discover(
        gateway_hint: Option<Ipv4Addr>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let mut guesses = Vec::new();
        if let Some(hint) = gateway_hint {
            guesses.push(hint);
        }
        guesses.extend(GATEWAY_GUESSES.iter().copied());

        for gateway in guesses {
            if nat_pmp_probe(gateway).await.is_ok() {
                log::info!("NAT-PMP gateway found at {}", gateway);
                return Ok(Self {
                    gateway: Gateway::NatPmp(gateway),
                    http,
                    mappings: Vec::new(),
                });
            }
        }

        let (control_url, service_type) = upnp_discover(&http).await?;
        log::info!("UPnP gateway found, control URL {}", control_url);
        Ok(Self {
            gateway: Gateway::Upnp {
                control_url,
                service_type,
            },
            http,
            mappings: Vec::new(),
        })
    }

    /// Requests an external mapping for the port and records it with its
    /// renewal schedule. Returns the external port the gateway granted.
    pub async fn map_port(
        &mut self,
        protocol: Protocol,
        port: u16,
        lease: Duration,
    ) -> Result<u16> {
        let external_port = match &self.gateway {
            Gateway::NatPmp(gateway) => {
                nat_pmp_map(*gateway, protocol, port, lease).await?
            }
            Gateway::Upnp {
                control_url,
                service_type,
            } => {
                upnp_map(
                    &self.http,
                    control_url,
                    service_type,
                    protocol,
                    port,
                    lease,
                )
                .await?;
                port
            }
        };
        log::info!(
            "Mapped {} port {} -> external {} for {:?}",
            protocol.upnp_name(),
            port,
            external_port,
            lease
        );
        self.mappings.push(PortMapping {
            protocol,
            internal_port: port,
            external_port,
            lease,
            renew_at: Instant::now() + lease / 2,
        });
        Ok(external_port)
    }

    /// Re-requests mappings whose renewal time has passed. Driven by the
    /// engine's cleanup loop.
    pub async fn refresh_due(&mut self) {
        let now = Instant::now();
        let due: Vec<PortMapping> = self
            .mappings
            .iter()
            .filter(|mapping| mapping.renew_at <= now)
            .copied()
            .collect();
        for mapping in due {
            self.mappings
                .retain(|m| m.internal_port != mapping.internal_port
                    || m.protocol != mapping.protocol);
            if let Err(e) = self
                .map_port(mapping.protocol, mapping.internal_port, mapping.lease)
                .await
            {
                log::warn!(
                    "Failed to renew mapping for port {}: {}",
                    mapping.internal_port,
                    e
                );
            }
        }
    }

    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }
}

/// Checks for a NAT-PMP gateway with an external-address request.
async fn nat_pmp_probe(gateway: Ipv4Addr) -> Result<()> {
    let response =
        nat_pmp_exchange(gateway, &[0u8, 0u8], NAT_PMP_TIMEOUT).await?;
    if response.len() >= 4 && response[0] == 0 && response[1] == 128 {
        let result = u16::from_be_bytes([response[2], response[3]]);
        if result == 0 {
            return Ok(());
        }
    }
    Err(Error::Timeout)
}

/// Requests a NAT-PMP mapping and returns the granted external port.
async fn nat_pmp_map(
    gateway: Ipv4Addr,
    protocol: Protocol,
    port: u16,
    lease: Duration,
) -> Result<u16> {
    let request = build_nat_pmp_mapping_request(protocol, port, lease);
    let response =
        nat_pmp_exchange(gateway, &request, NAT_PMP_TIMEOUT).await?;
    parse_nat_pmp_mapping_response(&response, protocol)
}

async fn nat_pmp_exchange(
    gateway: Ipv4Addr,
    request: &[u8],
    wait: Duration,
) -> Result<Vec<u8>> {
    let mut socket =
        UdpSocket::bind::<SocketAddr>(([0, 0, 0, 0], 0).into()).await?;
    let gateway_addr = SocketAddr::new(IpAddr::V4(gateway), NAT_PMP_PORT);
    socket.send_to(request, &gateway_addr).await?;
    let mut buf = vec![0u8; 64];
    let (len, _) = timeout(wait, socket.recv_from(&mut buf)).await??;
    buf.truncate(len);
    Ok(buf)
}

fn build_nat_pmp_mapping_request(
    protocol: Protocol,
    port: u16,
    lease: Duration,
) -> Vec<u8> {
    let mut request = BytesMut::with_capacity(12);
    request.put_u8(0); // version
    request.put_u8(protocol.nat_pmp_opcode());
    request.put_u16(0); // reserved
    request.put_u16(port); // internal port
    request.put_u16(port); // suggested external port
    request.put_u32(lease.as_secs() as u32);
    request.to_vec()
}

fn parse_nat_pmp_mapping_response(
    response: &[u8],
    protocol: Protocol,
) -> Result<u16> {
    if response.len() < 16 {
        return Err(Error::Timeout);
    }
    let mut response = &response[..];
    let version = response.get_u8();
    let opcode = response.get_u8();
    let result = response.get_u16();
    if version != 0 || opcode != 128 + protocol.nat_pmp_opcode() {
        return Err(Error::Timeout);
    }
    if result != 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("NAT-PMP mapping refused with code {}", result),
        )));
    }
    response.advance(4); // seconds since epoch
    response.advance(2); // internal port
    Ok(response.get_u16())
}

/// Discovers an internet gateway device over SSDP and extracts the control
/// URL of its WAN connection service from the device description.
async fn upnp_discover(http: &reqwest::Client) -> Result<(Url, String)> {
    let mut socket =
        UdpSocket::bind::<SocketAddr>(([0, 0, 0, 0], 0).into()).await?;
    let search = "M-SEARCH * HTTP/1.1\r\n\
                  HOST: 239.255.255.250:1900\r\n\
                  MAN: \"ssdp:discover\"\r\n\
                  MX: 2\r\n\
                  ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
                  \r\n";
    let ssdp_addr: SocketAddr = SSDP_ADDR
        .parse()
        .map_err(|_| Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad SSDP address",
        )))?;
    socket.send_to(search.as_bytes(), &ssdp_addr).await?;

    let mut buf = vec![0u8; 2048];
    let (len, from) =
        timeout(SSDP_TIMEOUT, socket.recv_from(&mut buf)).await??;
    let response = String::from_utf8_lossy(&buf[..len]).into_owned();
    log::debug!("SSDP response from {}", from);

    let location = response
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("location") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .ok_or(Error::Timeout)?;
    let location = Url::parse(&location).map_err(|_| Error::Timeout)?;

    let description = http
        .get(location.as_str())
        .send()
        .await?
        .text()
        .await?;
    let (service_type, control_path) = extract_wan_service(&description)
        .ok_or(Error::Timeout)?;
    let control_url =
        location.join(&control_path).map_err(|_| Error::Timeout)?;
    Ok((control_url, service_type))
}

/// Pulls the WANIPConnection (or WANPPPConnection) service type and control
/// URL out of a device description document. The document is scanned
/// service block by service block, which is robust enough for the gateway
/// descriptions in the wild without pulling in an XML parser.
fn extract_wan_service(description: &str) -> Option<(String, String)> {
    let mut rest = description;
    while let Some(start) = rest.find("<service>") {
        let end = rest[start..].find("</service>")? + start;
        let block = &rest[start..end];
        if let Some(service_type) = extract_tag(block, "serviceType") {
            if service_type.contains("WANIPConnection")
                || service_type.contains("WANPPPConnection")
            {
                if let Some(control_url) = extract_tag(block, "controlURL") {
                    return Some((service_type, control_url));
                }
            }
        }
        rest = &rest[end + "</service>".len()..];
    }
    None
}

fn extract_tag(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(block[start..end].trim().to_string())
}

/// Issues the SOAP `AddPortMapping` action on the gateway's control URL.
async fn upnp_map(
    http: &reqwest::Client,
    control_url: &Url,
    service_type: &str,
    protocol: Protocol,
    port: u16,
    lease: Duration,
) -> Result<()> {
    let internal_client = local_ip_towards(control_url).await?;
    let body = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:AddPortMapping xmlns:u="{service_type}">
      <NewRemoteHost></NewRemoteHost>
      <NewExternalPort>{port}</NewExternalPort>
      <NewProtocol>{protocol}</NewProtocol>
      <NewInternalPort>{port}</NewInternalPort>
      <NewInternalClient>{client}</NewInternalClient>
      <NewEnabled>1</NewEnabled>
      <NewPortMappingDescription>crabtorrent</NewPortMappingDescription>
      <NewLeaseDuration>{lease}</NewLeaseDuration>
    </u:AddPortMapping>
  </s:Body>
</s:Envelope>"#,
        service_type = service_type,
        port = port,
        protocol = protocol.upnp_name(),
        client = internal_client,
        lease = lease.as_secs(),
    );

    let response = http
        .post(control_url.as_str())
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header(
            "SOAPAction",
            format!("\"{}#AddPortMapping\"", service_type),
        )
        .body(body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("UPnP AddPortMapping failed: {}", response.status()),
        )));
    }
    Ok(())
}

/// The local address the OS routes towards the gateway with, needed for the
/// mapping's internal client field.
async fn local_ip_towards(control_url: &Url) -> Result<IpAddr> {
    let host = control_url
        .host_str()
        .ok_or(Error::Timeout)?
        .to_string();
    let port = control_url.port_or_known_default().unwrap_or(80);
    let mut socket =
        UdpSocket::bind::<SocketAddr>(([0, 0, 0, 0], 0).into()).await?;
    socket.connect((host.as_str(), port)).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_pmp_mapping_request_layout() {
        let request = build_nat_pmp_mapping_request(
            Protocol::Tcp,
            6881,
            Duration::from_secs(3600),
        );
        assert_eq!(request.len(), 12);
        assert_eq!(request[0], 0); // version
        assert_eq!(request[1], 2); // TCP opcode
        assert_eq!(&request[4..6], &6881u16.to_be_bytes());
        assert_eq!(&request[6..8], &6881u16.to_be_bytes());
        assert_eq!(&request[8..12], &3600u32.to_be_bytes());
    }

    #[test]
    fn test_nat_pmp_mapping_response_parsing() {
        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_u8(130); // 128 + TCP opcode
        response.put_u16(0); // success
        response.put_u32(1234); // epoch
        response.put_u16(6881); // internal
        response.put_u16(40000); // granted external
        response.put_u32(3600); // lifetime
        assert_eq!(
            parse_nat_pmp_mapping_response(&response, Protocol::Tcp).unwrap(),
            40000
        );

        // a refusal code is an error
        let mut refused = response.to_vec();
        refused[2] = 0;
        refused[3] = 2; // not authorized
        assert!(
            parse_nat_pmp_mapping_response(&refused, Protocol::Tcp).is_err()
        );
    }

    #[test]
    fn test_extract_wan_service() {
        let description = r#"
<root>
  <device>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/l3f</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <controlURL>/ctl/IPConn</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;
        let (service_type, control_url) =
            extract_wan_service(description).unwrap();
        assert_eq!(
            service_type,
            "urn:schemas-upnp-org:service:WANIPConnection:1"
        );
        assert_eq!(control_url, "/ctl/IPConn");
    }

    #[test]
    fn test_extract_wan_service_absent() {
        assert!(extract_wan_service("<root></root>").is_none());
    }
}
