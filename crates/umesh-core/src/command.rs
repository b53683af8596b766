//! Mesh command codes
//!
//! A command frame payload is one of these codes followed by TLVs.

pub const ADVERTISEMENT: u8 = 0x01;
pub const DISCOVERY_REQUEST: u8 = 0x02;
pub const DISCOVERY_RESPONSE: u8 = 0x03;
pub const ATTACH_REQUEST: u8 = 0x04;
pub const ATTACH_RESPONSE: u8 = 0x05;
pub const SID_REQUEST: u8 = 0x06;
pub const SID_RESPONSE: u8 = 0x07;
pub const ADDRESS_QUERY: u8 = 0x08;
pub const ADDRESS_QUERY_RESPONSE: u8 = 0x09;
pub const ADDRESS_NOTIFICATION: u8 = 0x0a;
pub const ADDRESS_UNREACHABLE: u8 = 0x0b;
pub const ADDRESS_ERROR: u8 = 0x0c;
pub const LINK_REQUEST: u8 = 0x0d;
pub const LINK_ACCEPT: u8 = 0x0e;
pub const LINK_ACCEPT_AND_REQUEST: u8 = 0x0f;
pub const ROUTING_INFO_UPDATE: u8 = 0x10;
pub const AUTH_DOT1X: u8 = 0x11;

/// Printable name of a command code
pub fn command_name(command: u8) -> &'static str {
    match command {
        ADVERTISEMENT => "advertisement",
        DISCOVERY_REQUEST => "discovery_request",
        DISCOVERY_RESPONSE => "discovery_response",
        ATTACH_REQUEST => "attach_request",
        ATTACH_RESPONSE => "attach_response",
        SID_REQUEST => "sid_request",
        SID_RESPONSE => "sid_response",
        ADDRESS_QUERY => "address_query",
        ADDRESS_QUERY_RESPONSE => "address_query_response",
        ADDRESS_NOTIFICATION => "address_notification",
        ADDRESS_UNREACHABLE => "address_unreachable",
        ADDRESS_ERROR => "address_error",
        LINK_REQUEST => "link_request",
        LINK_ACCEPT => "link_accept",
        LINK_ACCEPT_AND_REQUEST => "link_accept_and_request",
        ROUTING_INFO_UPDATE => "routing_info_update",
        AUTH_DOT1X => "auth_dot1x",
        _ => "unknown",
    }
}

/// Commands that always travel in the clear
pub fn is_clear_command(command: u8) -> bool {
    matches!(
        command,
        ADVERTISEMENT
            | DISCOVERY_REQUEST
            | DISCOVERY_RESPONSE
            | ATTACH_REQUEST
            | AUTH_DOT1X
            | LINK_ACCEPT
    )
}
