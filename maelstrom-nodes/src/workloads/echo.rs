use std::sync::Arc;

use crate::error::{DomainError, HandlerError};
use crate::message::{Envelope, Payload};
use crate::node::Node;
use crate::runtime::Workload;

/// Sends every `echo` body straight back.
#[derive(Debug, Default)]
pub struct Echo;

impl Workload for Echo {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Echo { echo } => node.reply(request, Payload::EchoOk { echo: echo.clone() }),
            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }
}
