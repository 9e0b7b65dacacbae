use std::net::SocketAddr;

use crate::config::StunServerConfig;
use crate::protocol::{Address, Body, EchoKind, Message, VodAddress};

/// Answers echo requests on an open node. Returns the messages to send.
pub struct StunResponder {
    config: StunServerConfig,
}

impl StunResponder {
    pub fn new(config: StunServerConfig) -> Self {
        Self { config }
    }

    pub fn alt_port(&self) -> u16 {
        self.config.alt_port
    }

    /// `local` is the address the request arrived on.
    pub fn respond(
        &self,
        me: &VodAddress,
        msg: &Message,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Vec<Message> {
        let observed = Address::from_socket(remote, msg.src.node_id());
        match &msg.body {
            Body::StunEchoRequest { kind, reply_to } => match kind {
                EchoKind::Plain => {
                    vec![self.echo_response(me, local.port(), observed, *kind, msg)]
                }
                EchoKind::ChangePort => {
                    if self.config.alt_port == 0 {
                        log::debug!("change-port echo from {remote} without alt port");
                        return vec![];
                    }
                    vec![self.echo_response(me, self.config.alt_port, observed, *kind, msg)]
                }
                EchoKind::ChangeServer => {
                    let Some(partner) = self.config.partner else {
                        log::debug!("change-server echo from {remote} without partner");
                        return vec![];
                    };
                    let relay = Message::new(
                        me.clone(),
                        partner,
                        Body::StunEchoRequest {
                            kind: EchoKind::Forwarded,
                            reply_to: Some(observed),
                        },
                    )
                    .with_timeout(msg.timeout_id);
                    vec![relay]
                }
                EchoKind::Forwarded => {
                    let Some(client) = reply_to else {
                        log::debug!("forwarded echo from {remote} without reply address");
                        return vec![];
                    };
                    vec![self.echo_response(me, me.addr.port, *client, EchoKind::ChangeServer, msg)]
                }
            },
            Body::StunReportRequest { report } => {
                log::info!("nat report from {observed}: {report}");
                vec![Message::new(me.clone(), observed, Body::StunReportResponse)
                    .with_timeout(msg.timeout_id)]
            }
            other => {
                log::debug!("stun server ignores {:?} from {remote}", other.opcode());
                vec![]
            }
        }
    }

    fn echo_response(
        &self,
        me: &VodAddress,
        port: u16,
        client: Address,
        kind: EchoKind,
        request: &Message,
    ) -> Message {
        let mut src = me.clone();
        src.addr.port = port;
        Message::new(
            src,
            client,
            Body::StunEchoResponse {
                observed: client,
                kind,
                alt_port: self.config.alt_port,
            },
        )
        .with_timeout(request.timeout_id)
    }
}
