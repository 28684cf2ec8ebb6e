use serde::{Deserialize, Serialize};

use super::Message;

/// Session announcement.
///
/// The server sends it with `id` set right after accepting a connection; the
/// client answers with the same `id` and the address it wants to be known by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetStat {
    pub id: String,
    #[serde(rename = "ipAddress", default)]
    pub ip_address: String,
}

impl Message for NetStat {
    const TYPE_TAG: &'static str = "MsgNetStat";
}

/// A line of chat text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub message: String,
}

impl Message for Chat {
    const TYPE_TAG: &'static str = "MsgChat";
}
