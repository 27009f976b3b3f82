//! Opening tunnels on behalf of browser requests.
//!
//! Both transports parse the request into a `TunnelRequest` and hand it to a
//! `TunnelConnector`; they never talk to guacd directly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use guactunnel_shared::io::{GuacamoleReader, GuacamoleWriter};
use guactunnel_shared::{Error, Result, Status};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::backend::BackendStream;
use crate::config::{ConnectionConfig, RelayConfig};
use crate::guacd::{self, ClientInfo};
use crate::tls;
use crate::tunnel::{BackendReader, BackendWriter, Tunnel};

pub const TYPE_PARAMETER: &str = "GUAC_TYPE";
pub const IDENTIFIER_PARAMETER: &str = "GUAC_ID";
pub const WIDTH_PARAMETER: &str = "GUAC_WIDTH";
pub const HEIGHT_PARAMETER: &str = "GUAC_HEIGHT";
pub const DPI_PARAMETER: &str = "GUAC_DPI";
pub const AUDIO_PARAMETER: &str = "GUAC_AUDIO";
pub const VIDEO_PARAMETER: &str = "GUAC_VIDEO";
pub const IMAGE_PARAMETER: &str = "GUAC_IMAGE";
pub const TIMEZONE_PARAMETER: &str = "GUAC_TIMEZONE";

/// Kind of object a tunnel request refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Connection,
}

impl TunnelType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "c" => Some(TunnelType::Connection),
            _ => None,
        }
    }
}

/// Parameters of a request to open a tunnel. Names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRequest {
    parameters: Vec<(String, String)>,
}

impl TunnelRequest {
    pub fn from_pairs(parameters: Vec<(String, String)>) -> Self {
        Self { parameters }
    }

    /// First value of the named parameter
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn parameter_values(&self, name: &str) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn required_parameter(&self, name: &str) -> Result<&str> {
        self.parameter(name)
            .ok_or_else(|| Error::bad_request(format!("Parameter \"{}\" is required.", name)))
    }

    pub fn integer_parameter(&self, name: &str) -> Result<Option<u32>> {
        self.parameter(name)
            .map(|value| {
                value.parse().map_err(|_| {
                    Error::bad_request(format!("Parameter \"{}\" must be a valid integer.", name))
                })
            })
            .transpose()
    }

    pub fn tunnel_type(&self) -> Result<TunnelType> {
        TunnelType::parse(self.required_parameter(TYPE_PARAMETER)?)
            .ok_or_else(|| Error::bad_request("Illegal identifier - unknown type."))
    }

    pub fn identifier(&self) -> Result<&str> {
        self.required_parameter(IDENTIFIER_PARAMETER)
    }

    pub fn width(&self) -> Result<Option<u32>> {
        self.integer_parameter(WIDTH_PARAMETER)
    }

    pub fn height(&self) -> Result<Option<u32>> {
        self.integer_parameter(HEIGHT_PARAMETER)
    }

    pub fn dpi(&self) -> Result<Option<u32>> {
        self.integer_parameter(DPI_PARAMETER)
    }

    pub fn audio_mimetypes(&self) -> Vec<String> {
        self.parameter_values(AUDIO_PARAMETER)
    }

    pub fn video_mimetypes(&self) -> Vec<String> {
        self.parameter_values(VIDEO_PARAMETER)
    }

    pub fn image_mimetypes(&self) -> Vec<String> {
        self.parameter_values(IMAGE_PARAMETER)
    }

    pub fn timezone(&self) -> Option<&str> {
        self.parameter(TIMEZONE_PARAMETER)
    }

    /// Client details for the guacd handshake; absent values keep defaults.
    pub fn client_info(&self) -> Result<ClientInfo> {
        let defaults = ClientInfo::default();
        Ok(ClientInfo {
            width: self.width()?.unwrap_or(defaults.width),
            height: self.height()?.unwrap_or(defaults.height),
            dpi: self.dpi()?.unwrap_or(defaults.dpi),
            audio_mimetypes: self.audio_mimetypes(),
            video_mimetypes: self.video_mimetypes(),
            image_mimetypes: self.image_mimetypes(),
            timezone: self.timezone().map(String::from),
        })
    }
}

/// Opens the tunnel a request asks for.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, request: &TunnelRequest) -> Result<Tunnel>;
}

/// Connects configured connections through guacd.
pub struct GuacdConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
    connections: HashMap<String, ConnectionConfig>,
}

impl GuacdConnector {
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let tls = if config.guacd.ssl {
            Some(tls::connector(config.guacd.ca_file.as_deref())?)
        } else {
            None
        };
        Ok(Self {
            host: config.guacd.host.clone(),
            port: config.guacd.port,
            connect_timeout: config.guacd.connect_timeout(),
            tls,
            connections: config.connections.clone(),
        })
    }

    async fn open_tcp(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Status::UpstreamTimeout.to_error(format!("Timeout connecting to guacd at {}", addr))
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Status::UpstreamNotFound
                    .to_error(format!("guacd is not listening at {}", addr)),
                _ => Status::UpstreamError
                    .to_error(format!("Failed to connect to guacd at {}: {}", addr, e)),
            })?;
        // Instructions are small and latency sensitive
        tcp.set_nodelay(true).map_err(Error::from_socket)?;
        debug!("Connected to guacd at {}", addr);
        Ok(tcp)
    }
}

#[async_trait]
impl TunnelConnector for GuacdConnector {
    async fn connect(&self, request: &TunnelRequest) -> Result<Tunnel> {
        let TunnelType::Connection = request.tunnel_type()?;
        let id = request.identifier()?;
        let connection = self
            .connections
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Connection \"{}\" does not exist.", id)))?;
        let info = request.client_info()?;

        let tcp = self.open_tcp().await?;
        let tunnel = match &self.tls {
            Some(connector) => {
                let stream = tls::handshake(connector, &self.host, tcp).await?;
                establish(stream, connection, &info).await?
            }
            None => establish(tcp, connection, &info).await?,
        };

        info!(
            "Connection \"{}\" ({}) established as {}",
            id,
            connection.protocol,
            tunnel.connection_id().unwrap_or("unknown")
        );
        Ok(tunnel)
    }
}

/// Run the guacd handshake over `stream` and wrap it in a tunnel.
pub async fn establish<S>(
    stream: S,
    connection: &ConnectionConfig,
    info: &ClientInfo,
) -> Result<Tunnel>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (stream, backend) = BackendStream::new(stream);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader: BackendReader = GuacamoleReader::new(Box::new(read_half));
    let mut writer: BackendWriter = GuacamoleWriter::new(Box::new(write_half));

    let handshake = guacd::handshake(
        &mut reader,
        &mut writer,
        &connection.protocol,
        &connection.parameters,
        info,
    )
    .await?;

    Ok(Tunnel::from_parts(
        reader,
        writer,
        backend,
        Some(handshake.connection_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn request(pairs: &[(&str, &str)]) -> TunnelRequest {
        TunnelRequest::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_request_parameters() {
        let req = request(&[
            ("GUAC_ID", "desktop"),
            ("GUAC_TYPE", "c"),
            ("GUAC_WIDTH", "1920"),
            ("GUAC_AUDIO", "audio/L8"),
            ("GUAC_AUDIO", "audio/L16"),
            ("GUAC_TIMEZONE", "America/New_York"),
        ]);
        assert_eq!(req.identifier().unwrap(), "desktop");
        assert_eq!(req.tunnel_type().unwrap(), TunnelType::Connection);
        assert_eq!(req.width().unwrap(), Some(1920));
        assert_eq!(req.height().unwrap(), None);
        assert_eq!(req.audio_mimetypes(), ["audio/L8", "audio/L16"]);

        let info = req.client_info().unwrap();
        assert_eq!((info.width, info.height, info.dpi), (1920, 768, 96));
        assert_eq!(info.timezone.as_deref(), Some("America/New_York"));
    }

    #[test]
    fn test_request_errors_are_client_errors() {
        let missing = request(&[("GUAC_TYPE", "c")]);
        let err = missing.identifier().unwrap_err();
        assert_eq!(err.status(), Status::ClientBadRequest);
        assert_eq!(err.to_string(), "Parameter \"GUAC_ID\" is required.");

        let bad_type = request(&[("GUAC_ID", "x"), ("GUAC_TYPE", "z")]);
        assert!(bad_type.tunnel_type().unwrap_err().is_client_error());

        let bad_width = request(&[("GUAC_WIDTH", "wide")]);
        assert!(bad_width.client_info().unwrap_err().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let connector = GuacdConnector::from_config(&RelayConfig::default()).unwrap();
        let err = connector
            .connect(&request(&[("GUAC_ID", "nope"), ("GUAC_TYPE", "c")]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::ResourceNotFound);
    }

    #[tokio::test]
    async fn test_refused_connection_is_upstream_not_found() {
        // Bind then drop to find a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = RelayConfig::default();
        config.guacd.host = "127.0.0.1".into();
        config.guacd.port = port;
        config.connections.insert(
            "desktop".into(),
            ConnectionConfig {
                protocol: "vnc".into(),
                parameters: HashMap::new(),
            },
        );
        let connector = GuacdConnector::from_config(&config).unwrap();
        let err = connector
            .connect(&request(&[("GUAC_ID", "desktop"), ("GUAC_TYPE", "c")]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::UpstreamNotFound);
    }

    #[tokio::test]
    async fn test_establish_keeps_data_after_ready() {
        let (relay, mut guacd) = tokio::io::duplex(4096);
        // guacd may send its first frame in the same segment as "ready"
        guacd
            .write_all(b"4.args,8.hostname;5.ready,4.$abc;4.sync,1.0;")
            .await
            .unwrap();

        let connection = ConnectionConfig {
            protocol: "vnc".into(),
            parameters: HashMap::new(),
        };
        let tunnel = establish(relay, &connection, &ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(tunnel.connection_id(), Some("$abc"));

        let mut reader = tunnel.acquire_reader().await;
        assert!(reader.available());
        assert_eq!(reader.read().await.unwrap().unwrap().opcode(), "sync");
    }
}
