//! PDU encoding.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Empty `{}` in association PDU", field))]
    EmptyAeTitle {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write PDU `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(backtrace)]
        source: WriteChunkError,
    },

    #[snafu(display("Refusing to encode a PDU of unknown type {}", pdu_type))]
    EncodeUnknownPdu { pdu_type: u8, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_ae_title(
    writer: &mut dyn Write,
    codec: &dyn TextCodec,
    ae_title: &str,
    field: &'static str,
) -> Result<()> {
    ensure!(!ae_title.trim().is_empty(), EmptyAeTitleSnafu { field });
    let mut bytes = codec.encode(ae_title).context(EncodeTextSnafu { field })?;
    // 16 bytes, space padded, silently truncated
    bytes.truncate(16);
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Write a single PDU to `writer`.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRq {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            // PDU type + reserved
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                write_ae_title(writer, &codec, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, &codec, calling_ae_title, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAc {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // bytes 11-42 echo the AE titles of the request
                write_ae_title(writer, &codec, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, &codec, calling_ae_title, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;

            Ok(())
        }
        Pdu::AssociationRj { result, source } => {
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;
                writer.write_u8(result.code()).context(WriteFieldSnafu {
                    field: "Result",
                })?;
                let (source_code, reason_code) = source.codes();
                writer.write_u8(source_code).context(WriteFieldSnafu {
                    field: "Source",
                })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(presentation_data_value.presentation_context_id);

                        // message control header:
                        // bit 0 = command, bit 1 = last fragment
                        let mut message_header = 0x00;
                        if presentation_data_value.value_type == PDataValueType::Command {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        writer.extend_from_slice(&presentation_data_value.data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRq => {
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_all(&[0; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::ReleaseRp => {
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_all(&[0; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::AbortRq { source } => {
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0; 2])
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;
                let (source_code, reason_code) = source.codes();
                writer.write_u8(source_code).context(WriteFieldSnafu {
                    field: "Source",
                })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, .. } => EncodeUnknownPduSnafu {
            pdu_type: *pdu_type,
        }
        .fail(),
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer.write_u8(0x10).context(WriteFieldSnafu {
        field: "Item-type",
    })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        let bytes = codec
            .encode(application_context_name)
            .context(EncodeTextSnafu {
                field: "Application-context-name",
            })?;
        writer.extend_from_slice(&bytes);
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer.write_u8(0x20).context(WriteFieldSnafu {
        field: "Item-type",
    })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer.extend_from_slice(&[0x00; 3]);

        write_uid_sub_item(
            writer,
            0x30,
            &presentation_context.abstract_syntax,
            codec,
            "Abstract-syntax-name",
        )?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_uid_sub_item(writer, 0x40, transfer_syntax, codec, "Transfer-syntax-name")?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item (proposed)",
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer.write_u8(0x21).context(WriteFieldSnafu {
        field: "Item-type",
    })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer.push(0x00);
        writer.push(presentation_context.reason as u8);
        writer.push(0x00);

        write_uid_sub_item(
            writer,
            0x40,
            &presentation_context.transfer_syntax,
            codec,
            "Transfer-syntax-name",
        )?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item (result)",
    })
}

fn write_uid_sub_item(
    writer: &mut dyn Write,
    item_type: u8,
    uid: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    writer.write_u8(item_type).context(WriteFieldSnafu {
        field: "Item-type",
    })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        let bytes = codec.encode(uid).context(EncodeTextSnafu { field })?;
        writer.extend_from_slice(&bytes);
        Ok(())
    })
    .context(WriteChunkSnafu { name: "Sub-item" })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    writer.write_u8(0x50).context(WriteFieldSnafu {
        field: "Item-type",
    })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer.write_u8(0x51).context(WriteFieldSnafu {
                        field: "Item-type",
                    })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length Sub-item",
                    })?;
                }
                UserVariableItem::ImplementationClassUid(uid) => {
                    write_uid_sub_item(writer, 0x52, uid, codec, "Implementation-class-uid")?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_uid_sub_item(writer, 0x55, name, codec, "Implementation-version-name")?;
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                } => {
                    writer.write_u8(0x53).context(WriteFieldSnafu {
                        field: "Item-type",
                    })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*max_operations_invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*max_operations_performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window Sub-item",
                    })?;
                }
                UserVariableItem::RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                } => {
                    writer.write_u8(0x54).context(WriteFieldSnafu {
                        field: "Item-type",
                    })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let bytes = codec.encode(sop_class_uid).context(EncodeTextSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(bytes.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.extend_from_slice(&bytes);
                        writer.push(u8::from(*scu_role));
                        writer.push(u8::from(*scp_role));
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Role Selection Sub-item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer.write_u8(*item_type).context(WriteFieldSnafu {
                        field: "Item-type",
                    })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer.extend_from_slice(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Unknown Sub-item",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "User Information Item",
    })
}
