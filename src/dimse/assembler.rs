//! Reassembly of DIMSE messages from P-DATA fragments.
//!
//! A logical DIMSE message arrives as a sequence of presentation
//! data values: one or more command fragments, optionally followed
//! by one or more data fragments, all under the same presentation
//! context. The [`CommandAssembler`] is fed every inbound PDV
//! and signals completion exactly once per message:
//! when the last command fragment has been parsed and,
//! if the command announces a data set, the last data fragment
//! has been received.

use snafu::{ensure, ResultExt, Snafu};

use crate::dimse::dataset::{DataSetHandle, DataSetSpool};
use crate::dimse::Message;
use crate::pdu::{PDataValue, PDataValueType};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "Mixed presentation contexts within one message: {} then {}",
        expected,
        got
    ))]
    MixedPresentationContext { expected: u8, got: u8 },

    #[snafu(display("More than one command fragment with the last bit set"))]
    DuplicateLastCommand,

    #[snafu(display("More than one data fragment with the last bit set"))]
    DuplicateLastData,

    #[snafu(display("Could not decode command set"))]
    DecodeCommand {
        #[snafu(source(from(crate::dimse::Error, Box::from)))]
        source: Box<crate::dimse::Error>,
    },

    #[snafu(display("Could not spool data set fragment"))]
    SpoolData { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled DIMSE message.
#[derive(Debug)]
pub struct AssembledMessage {
    /// the presentation context the message arrived under
    pub context_id: u8,
    /// the parsed command
    pub message: Message,
    /// the accompanying data set, if the command announced one
    pub data: Option<DataSetHandle>,
}

/// Reassembles one DIMSE message at a time
/// from a stream of presentation data values.
#[derive(Debug)]
pub struct CommandAssembler {
    spool_threshold: usize,
    context_id: Option<u8>,
    command_bytes: Vec<u8>,
    message: Option<Message>,
    data: Option<DataSetSpool>,
    command_complete: bool,
    data_complete: bool,
}

impl CommandAssembler {
    /// Create an assembler whose data sets spill to disk
    /// above `spool_threshold` bytes.
    pub fn new(spool_threshold: usize) -> Self {
        CommandAssembler {
            spool_threshold,
            context_id: None,
            command_bytes: Vec::new(),
            message: None,
            data: None,
            command_complete: false,
            data_complete: false,
        }
    }

    /// Feed the presentation data values of one P-DATA-TF PDU.
    ///
    /// Returns `Ok(Some(_))` exactly when the message became complete,
    /// resetting the assembler for the next message.
    /// An empty PDV list is accepted and leaves the state unchanged.
    pub fn feed(&mut self, pdvs: Vec<PDataValue>) -> Result<Option<AssembledMessage>> {
        for pdv in pdvs {
            match self.context_id {
                None => self.context_id = Some(pdv.presentation_context_id),
                Some(expected) => {
                    ensure!(
                        expected == pdv.presentation_context_id,
                        MixedPresentationContextSnafu {
                            expected,
                            got: pdv.presentation_context_id,
                        }
                    );
                }
            }

            match pdv.value_type {
                PDataValueType::Command => {
                    ensure!(!(pdv.is_last && self.command_complete), DuplicateLastCommandSnafu);
                    self.command_bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        self.command_complete = true;
                    }
                }
                PDataValueType::Data => {
                    ensure!(!(pdv.is_last && self.data_complete), DuplicateLastDataSnafu);
                    self.data
                        .get_or_insert_with(|| DataSetSpool::new(self.spool_threshold))
                        .push(&pdv.data)
                        .context(SpoolDataSnafu)?;
                    if pdv.is_last {
                        self.data_complete = true;
                    }
                }
            }
        }

        if !self.command_complete {
            return Ok(None);
        }

        if self.message.is_none() {
            self.message =
                Some(Message::decode(&self.command_bytes).context(DecodeCommandSnafu)?);
        }

        let has_data = self
            .message
            .as_ref()
            .map(Message::has_data)
            .unwrap_or(false);
        if has_data && !self.data_complete {
            return Ok(None);
        }

        // message complete: hand it out and reset for the next one
        let context_id = self.context_id.take().unwrap_or(0);
        let message = match self.message.take() {
            Some(message) => message,
            None => return Ok(None),
        };
        let data = if has_data {
            Some(
                self.data
                    .take()
                    .unwrap_or_else(|| DataSetSpool::new(self.spool_threshold))
                    .into_handle(),
            )
        } else {
            None
        };
        *self = CommandAssembler::new(self.spool_threshold);

        Ok(Some(AssembledMessage {
            context_id,
            message,
            data,
        }))
    }
}
