/// Endpoint configuration.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Base URL of the call backend, e.g. `http://support.example.net`.
    pub backend_base_url: String,
    /// Base URL of the signaling relay WebSocket endpoint,
    /// e.g. `ws://support.example.net/ws`. The endpoint identifier is
    /// appended as the final path segment.
    pub relay_ws_url: String,
    /// STUN servers handed to the primary and recording connections.
    pub stun_servers: Vec<String>,
    /// Whether to mirror local media to the recording sink.
    pub recording_enabled: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            backend_base_url: "http://localhost:8000".to_string(),
            relay_ws_url: "ws://localhost:8000/ws".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            recording_enabled: true,
        }
    }
}
