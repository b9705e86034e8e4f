use serde::{Deserialize, Serialize};

/// The first frame a client must send: the `Authorization`-style token plus
/// the user it is declaring itself to be (§4.4 "open session"). Everything
/// after this frame is a [`imss_protocol::ClientFrame`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenSessionRequest {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub token: String,
    #[serde(rename = "clientType", default)]
    pub client_type: Option<imss_protocol::ClientType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionAck {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "gatewayId")]
    pub gateway_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionError {
    pub error: String,
}
