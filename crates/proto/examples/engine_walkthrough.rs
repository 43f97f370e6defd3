//! IKE Engine Walkthrough
//!
//! Loads a gateway and a client configuration from JSON, then lets the two
//! engines negotiate an IKE SA and a Child SA over an in-memory "network".
//! Prints the resulting SA tables and counters as JSON.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=ike_proto=debug cargo run --example engine_walkthrough --features ipsec
//! ```

use ike_platform::{init_tracing, TracingSink};
use ike_proto::ipsec::{
    config::EngineConfig,
    context::EngineContext,
    directory::DispatchOutcome,
    ike_sa::{ChildSaRequest, IpsecMode, IpsecProtocol, OutboundMessage},
};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

const GATEWAY: &str = r#"{
    "general": { "cookie_threshold": 0, "max_half_open": 100 },
    "peers": [{
        "prefixes": ["192.0.2.0/24"],
        "role": "responder",
        "local_id": { "id_type": "fqdn", "value": "gw.example" },
        "allowed_ids": [{ "kind": "suffix", "id_type": "fqdn", "suffix": ".example" }],
        "psk": "walkthrough secret",
        "proposals": [{ "encryption": "aes-cbc", "key_bits": 128, "prf": "hmac-sha256",
                        "integrity": "hmac-sha256-128", "dh": "group14" }]
    }]
}"#;

const CLIENT: &str = r#"{
    "peers": [{
        "prefixes": ["198.51.100.0/24"],
        "role": "initiator",
        "local_id": { "id_type": "fqdn", "value": "laptop.example" },
        "allowed_ids": [{ "kind": "exact", "id_type": "fqdn", "value": "gw.example" }],
        "psk": "walkthrough secret",
        "proposals": [{ "encryption": "aes-cbc", "key_bits": 128, "prf": "hmac-sha256",
                        "integrity": "hmac-sha256-128", "dh": "group14" }]
    }]
}"#;

struct Node {
    name: &'static str,
    addr: IpAddr,
    ctx: EngineContext,
}

fn load(name: &'static str, addr: &str, json: &str) -> Result<Node, Box<dyn std::error::Error>> {
    let policy = EngineConfig::from_json_str(json)?.into_policy_store()?;
    Ok(Node {
        name,
        addr: addr.parse()?,
        ctx: EngineContext::from_policy(policy, Arc::new(TracingSink)),
    })
}

/// Deliver one datagram; returns the replies it produced
fn deliver(to: &Node, from: IpAddr, message: &OutboundMessage) -> Vec<OutboundMessage> {
    match to.ctx.dispatch_datagram(&message.bytes, from, to.addr) {
        DispatchOutcome::Queued(spi) => to.ctx.run_ike_sa(spi),
        DispatchOutcome::CookieRequired(challenge) => {
            println!("{} demands a cookie", to.name);
            vec![challenge]
        }
        DispatchOutcome::Refused => {
            println!("{} refused the request", to.name);
            Vec::new()
        }
        DispatchOutcome::Dropped(e) => {
            println!("{} dropped a datagram: {}", to.name, e);
            Vec::new()
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("ike_proto=info");

    let gateway = load("gateway", "198.51.100.7", GATEWAY)?;
    let client = load("client", "192.0.2.10", CLIENT)?;

    let spi = client.ctx.request_child_sa(
        client.addr,
        gateway.addr,
        ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
    )?;

    // (destination is gateway, datagram)
    let mut wire: VecDeque<(bool, OutboundMessage)> = client
        .ctx
        .run_ike_sa(spi)
        .into_iter()
        .map(|m| (true, m))
        .collect();

    while let Some((to_gateway, message)) = wire.pop_front() {
        println!(
            "{} {:?} message {} ({} bytes)",
            if to_gateway { "client  -> gateway" } else { "gateway -> client " },
            message.message.header.exchange_type,
            message.message.header.message_id,
            message.bytes.len()
        );
        let replies = if to_gateway {
            deliver(&gateway, client.addr, &message)
        } else {
            deliver(&client, gateway.addr, &message)
        };
        wire.extend(replies.into_iter().map(|m| (!to_gateway, m)));
    }

    for node in [&client, &gateway] {
        println!("\n== {} ==", node.name);
        println!("{}", serde_json::to_string_pretty(&node.ctx.snapshot())?);
        println!("{}", serde_json::to_string_pretty(&node.ctx.metrics_snapshot())?);
    }

    Ok(())
}
