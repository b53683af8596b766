//! Line commands accepted by `umesh node` on stdin

use anyhow::{anyhow, bail, Result};
use std::fmt::Write as _;
use umesh_core::{ExtAddr, MeshAddr, MeshError, MeshNode, Mode, RouterKind};

/// One parsed stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Start,
    Stop,
    Status,
    Stats { json: bool },
    Neighbors,
    Mode(Option<Mode>),
    Router(Option<RouterKind>),
    Channel(Option<u8>),
    MeshNetId,
    ExtNetId(Option<Vec<u8>>),
    Whitelist(WhitelistOp),
    Send { dest: Destination, payload: Vec<u8> },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistOp {
    Show,
    Enable,
    Disable,
    Add(ExtAddr),
    Remove(ExtAddr),
    Clear,
}

/// Target of `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    /// SID on our own network
    Sid(u16),
    Uuid(ExtAddr),
}

pub const HELP: &str = "\
commands:
  start | stop | status | stats [--json] | nbrs
  mode [none|rx_on|mobile|leader|super,...]
  router [sid|vector]
  channel [n]
  meshnetid
  extnetid [hex]
  whitelist [on|off|add <mac>|remove <mac>|clear]
  send <bcast|sid-hex|mac> <text>";

/// Parse a mode list such as `rx_on,leader`
pub fn parse_mode(text: &str) -> Result<Mode> {
    let mut mode = Mode::NONE;
    for name in text.split([',', '|']).map(str::trim).filter(|s| !s.is_empty()) {
        let bit = match name.to_ascii_lowercase().as_str() {
            "none" => Mode::NONE,
            "rx_on" | "rxon" => Mode::RX_ON,
            "mobile" => Mode::MOBILE,
            "leader" => Mode::LEADER,
            "super" => Mode::SUPER,
            other => bail!("unknown mode bit: {}", other),
        };
        mode.insert(bit);
    }
    Ok(mode)
}

/// Bytes from hex, separators allowed
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    hex::decode(digits.trim_start_matches("0x")).map_err(|e| anyhow!("bad hex {}: {}", text, e))
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn parse_mac(text: &str) -> Result<ExtAddr> {
    text.parse::<ExtAddr>().map_err(|e| anyhow!("bad mac {}: {}", text, e))
}

fn parse_destination(text: &str) -> Result<Destination> {
    if text.eq_ignore_ascii_case("bcast") {
        return Ok(Destination::Broadcast);
    }
    let digits = text.trim_start_matches("0x");
    if digits.len() <= 4 {
        let sid = u16::from_str_radix(digits, 16).map_err(|_| anyhow!("bad sid: {}", text))?;
        return Ok(Destination::Sid(sid));
    }
    parse_mac(text).map(Destination::Uuid)
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        let command = match verb {
            "start" => ShellCommand::Start,
            "stop" => ShellCommand::Stop,
            "status" => ShellCommand::Status,
            "stats" => ShellCommand::Stats {
                json: arg == Some("--json"),
            },
            "nbrs" => ShellCommand::Neighbors,
            "mode" => ShellCommand::Mode(arg.map(parse_mode).transpose()?),
            "router" => ShellCommand::Router(
                arg.map(|a| a.parse::<RouterKind>().map_err(|e| anyhow!("{}: {}", a, e)))
                    .transpose()?,
            ),
            "channel" => ShellCommand::Channel(
                arg.map(|a| a.parse::<u8>().map_err(|_| anyhow!("bad channel: {}", a)))
                    .transpose()?,
            ),
            "meshnetid" => ShellCommand::MeshNetId,
            "extnetid" => ShellCommand::ExtNetId(arg.map(parse_hex).transpose()?),
            "whitelist" => ShellCommand::Whitelist(match arg {
                None => WhitelistOp::Show,
                Some("on") => WhitelistOp::Enable,
                Some("off") => WhitelistOp::Disable,
                Some("clear") => WhitelistOp::Clear,
                Some("add") => WhitelistOp::Add(parse_mac(words.next().ok_or_else(|| anyhow!("whitelist add <mac>"))?)?),
                Some("remove") => {
                    WhitelistOp::Remove(parse_mac(words.next().ok_or_else(|| anyhow!("whitelist remove <mac>"))?)?)
                }
                Some(other) => bail!("unknown whitelist operation: {}", other),
            }),
            "send" => {
                let dest = parse_destination(arg.ok_or_else(|| anyhow!("send <dest> <text>"))?)?;
                let text: Vec<&str> = words.collect();
                if text.is_empty() {
                    bail!("send <dest> <text>");
                }
                ShellCommand::Send {
                    dest,
                    payload: text.join(" ").into_bytes(),
                }
            }
            "help" | "?" => ShellCommand::Help,
            other => bail!("unknown command: {} (try help)", other),
        };
        Ok(Some(command))
    }

    /// Run the command against `node`, returning what to print
    pub fn execute(&self, node: &mut MeshNode) -> Result<String> {
        let mut out = String::new();
        match self {
            ShellCommand::Start => {
                node.start().map_err(|e| anyhow!("start failed: {}", e))?;
                out.push_str("started");
            }
            ShellCommand::Stop => {
                node.stop();
                out.push_str("stopped");
            }
            ShellCommand::Status => {
                let _ = writeln!(out, "state:     {}", node.state());
                let _ = writeln!(out, "uuid:      {}", node.uuid());
                let _ = writeln!(out, "mode:      {}", node.mode());
                let _ = writeln!(out, "sid:       {:04x}", node.sid());
                let _ = writeln!(out, "meshnetid: {:04x}", node.meshnetid());
                let _ = writeln!(out, "path cost: {}", node.path_cost());
                match node.parent() {
                    Some(parent) => {
                        let _ = write!(out, "parent:    {}", parent);
                    }
                    None => out.push_str("parent:    -"),
                }
            }
            ShellCommand::Stats { json } => {
                let stats = node.stats();
                if *json {
                    out = serde_json::to_string_pretty(&stats)?;
                } else {
                    let _ = writeln!(out, "state {} sid {:04x} netid {:04x}", stats.state, stats.sid, stats.meshnetid);
                    let _ = writeln!(
                        out,
                        "neighbors {} address cache {} ({} querying, {} parked) sid cache {} sleep {} ms",
                        stats.neighbors,
                        stats.address_cache,
                        stats.address_queries,
                        stats.pending_messages,
                        stats.sid_cache,
                        stats.sleep_time
                    );
                    for (i, hal) in stats.hals.iter().enumerate() {
                        let _ = writeln!(
                            out,
                            "hal {}: in {} out {} data {}/{} cmd {}/{} drops {} filtered {} errors {} timeouts {}",
                            i,
                            hal.in_frames,
                            hal.out_frames,
                            hal.in_data,
                            hal.out_data,
                            hal.in_command,
                            hal.out_command,
                            hal.in_drops,
                            hal.in_filterings,
                            hal.out_errors,
                            hal.sending_timeouts
                        );
                    }
                }
            }
            ShellCommand::Neighbors => {
                let _ = writeln!(
                    out,
                    "{:<24} {:<6} {:<6} {:<10} {:<8} {:<6} {:<6}",
                    "mac", "sid", "netid", "state", "mode", "link", "path"
                );
                for nbr in node.neighbors() {
                    let _ = writeln!(
                        out,
                        "{:<24} {:04x}   {:04x}   {:<10} {:<8} {:<6} {:<6}",
                        nbr.mac.to_string(),
                        nbr.sid,
                        nbr.netid,
                        format!("{:?}", nbr.state),
                        nbr.mode.to_string(),
                        nbr.link_cost,
                        nbr.path_cost
                    );
                }
            }
            ShellCommand::Mode(None) => {
                let _ = write!(out, "mode: {}", node.mode());
            }
            ShellCommand::Mode(Some(mode)) => {
                node.set_mode(*mode).map_err(|e| match e {
                    MeshError::Busy => anyhow!("stop the node before changing its mode"),
                    other => anyhow!("mode change failed: {}", other),
                })?;
                let _ = write!(out, "mode: {}", node.mode());
            }
            ShellCommand::Router(None) => {
                let _ = write!(out, "router: {:?}", node.config().router);
            }
            ShellCommand::Router(Some(kind)) => {
                node.set_router(*kind).map_err(|e| anyhow!("router change failed: {}", e))?;
                let _ = write!(out, "router: {:?}", kind);
            }
            ShellCommand::Channel(None) => match node.channel(0) {
                Some(channel) => {
                    let _ = write!(out, "channel: {}", channel);
                }
                None => out.push_str("no radio"),
            },
            ShellCommand::Channel(Some(channel)) => {
                node.set_channel(0, *channel).map_err(|e| anyhow!("channel change failed: {}", e))?;
                let _ = write!(out, "channel: {}", channel);
            }
            ShellCommand::MeshNetId => {
                let _ = write!(out, "meshnetid: {:04x}", node.meshnetid());
            }
            ShellCommand::ExtNetId(None) => {
                let _ = write!(out, "extnetid: {}", to_hex(&node.extnetid()));
            }
            ShellCommand::ExtNetId(Some(extnetid)) => {
                node.set_extnetid(extnetid).map_err(|e| anyhow!("extnetid change failed: {}", e))?;
                let _ = write!(out, "extnetid: {}", to_hex(extnetid));
            }
            ShellCommand::Whitelist(op) => {
                let list = node.whitelist_mut();
                match op {
                    WhitelistOp::Show => {}
                    WhitelistOp::Enable => list.enable(),
                    WhitelistOp::Disable => list.disable(),
                    WhitelistOp::Add(mac) => list.add(*mac).map_err(|e| anyhow!("whitelist full: {}", e))?,
                    WhitelistOp::Remove(mac) => list.remove(mac),
                    WhitelistOp::Clear => list.clear(),
                }
                let list = node.whitelist();
                let _ = write!(out, "whitelist {}", if list.is_enabled() { "on" } else { "off" });
                for mac in list.entries() {
                    let _ = write!(out, "\n  {}", mac);
                }
            }
            ShellCommand::Send { dest, payload } => {
                if !node.is_attached() {
                    bail!("not attached");
                }
                let netid = node.meshnetid();
                let result = match dest {
                    Destination::Broadcast => node.send_data(MeshAddr::bcast(netid), payload),
                    Destination::Sid(sid) => node.send_data(MeshAddr::short(netid, *sid), payload),
                    Destination::Uuid(mac) => node.send_data_to_uuid(*mac, payload),
                };
                match result {
                    Ok(()) => out.push_str("sent"),
                    Err(MeshError::AddressQuery) => out.push_str("queued until the address resolves"),
                    Err(e) => bail!("send failed: {}", e),
                }
            }
            ShellCommand::Help => out.push_str(HELP),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode_list() {
        let mode = parse_mode("rx_on,leader").unwrap();
        assert!(mode.is_rx_on());
        assert!(mode.contains(Mode::LEADER));
        assert_eq!(parse_mode("none").unwrap(), Mode::NONE);
        assert!(parse_mode("turbo").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("80 01:ff").unwrap(), vec![0x80, 0x01, 0xff]);
        assert_eq!(parse_hex("0xabcd").unwrap(), vec![0xab, 0xcd]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_extnetid() {
        assert_eq!(
            ShellCommand::parse("extnetid 01:02:03:04:05:06").unwrap(),
            Some(ShellCommand::ExtNetId(Some(vec![1, 2, 3, 4, 5, 6])))
        );
        assert_eq!(ShellCommand::parse("extnetid").unwrap(), Some(ShellCommand::ExtNetId(None)));
        assert!(ShellCommand::parse("extnetid 0g").is_err());
    }

    #[test]
    fn test_parse_send() {
        let cmd = ShellCommand::parse("send 1000 hello mesh").unwrap().unwrap();
        assert_eq!(
            cmd,
            ShellCommand::Send {
                dest: Destination::Sid(0x1000),
                payload: b"hello mesh".to_vec()
            }
        );
        let cmd = ShellCommand::parse("send bcast hi").unwrap().unwrap();
        assert!(matches!(cmd, ShellCommand::Send { dest: Destination::Broadcast, .. }));
        let cmd = ShellCommand::parse("send 02:00:00:00:00:00:00:01 hi").unwrap().unwrap();
        assert!(matches!(cmd, ShellCommand::Send { dest: Destination::Uuid(_), .. }));
        assert!(ShellCommand::parse("send 1000").is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(ShellCommand::parse("").unwrap(), None);
        assert_eq!(ShellCommand::parse("stats --json").unwrap(), Some(ShellCommand::Stats { json: true }));
        assert_eq!(ShellCommand::parse("channel 6").unwrap(), Some(ShellCommand::Channel(Some(6))));
        assert_eq!(
            ShellCommand::parse("router vector").unwrap(),
            Some(ShellCommand::Router(Some(RouterKind::Vector)))
        );
        assert_eq!(
            ShellCommand::parse("whitelist on").unwrap(),
            Some(ShellCommand::Whitelist(WhitelistOp::Enable))
        );
        assert!(ShellCommand::parse("launch").is_err());
    }

    #[test]
    fn test_execute_on_idle_node() {
        let mut node = MeshNode::new(umesh_core::MeshConfig::default().with_seed(1));
        let out = ShellCommand::Status.execute(&mut node).unwrap();
        assert!(out.contains("state:"));
        let out = ShellCommand::Mode(Some(Mode::RX_ON.with(Mode::LEADER))).execute(&mut node).unwrap();
        assert!(out.contains("LEADER"));
        assert!(ShellCommand::Start.execute(&mut node).is_err());
        let cmd = ShellCommand::Send {
            dest: Destination::Broadcast,
            payload: b"x".to_vec(),
        };
        assert!(cmd.execute(&mut node).is_err());
    }
}
