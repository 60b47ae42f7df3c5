use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use packetwire_frame::{Encoding, Headers, Packet};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput<'a> {
    kind: &'static str,
    id: Option<String>,
    headers: &'a Headers,
    payload_size: usize,
    payload: Option<String>,
    peer: &'a str,
    timestamp: String,
}

pub fn print_packet(packet: &Packet, peer: &str, encoding: Encoding, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PacketOutput {
                kind: "packet",
                id: packet.id.as_ref().map(ToString::to_string),
                headers: &packet.headers,
                payload_size: packet.payload_len(),
                payload: packet
                    .payload
                    .as_deref()
                    .map(|payload| payload_preview(payload, encoding)),
                peer,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "SIZE", "PEER", "HEADERS", "PAYLOAD"])
                .add_row(vec![
                    id_label(packet),
                    packet.payload_len().to_string(),
                    peer.to_string(),
                    headers_summary(&packet.headers),
                    payload_cell(packet, encoding),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "id={} size={} peer={} headers={} payload={}",
                id_label(packet),
                packet.payload_len(),
                peer,
                headers_summary(&packet.headers),
                payload_cell(packet, encoding)
            );
        }
        OutputFormat::Raw => {
            if let Some(payload) = &packet.payload {
                print_raw(payload);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn id_label(packet: &Packet) -> String {
    packet
        .id
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string)
}

fn headers_summary(headers: &Headers) -> String {
    if headers.is_empty() {
        return "-".to_string();
    }
    headers
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn payload_cell(packet: &Packet, encoding: Encoding) -> String {
    match &packet.payload {
        Some(payload) => payload_preview(payload, encoding),
        None => "<none>".to_string(),
    }
}

fn payload_preview(payload: &[u8], encoding: Encoding) -> String {
    match encoding.decode(payload) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) => text,
        _ => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previews_text_and_flags_binary() {
        assert_eq!(payload_preview(b"hello", Encoding::Utf8), "hello");
        assert_eq!(payload_preview(&[0xFF, 0x00], Encoding::Utf8), "<binary 2 bytes>");
        assert_eq!(payload_preview(&[0xE9], Encoding::Latin1), "é");
    }

    #[test]
    fn summarizes_headers_in_order() {
        let packet = Packet::new()
            .with_header("b", "2")
            .with_header("a", "1");
        assert_eq!(headers_summary(&packet.headers), "b=2, a=1");
        assert_eq!(headers_summary(&Headers::default()), "-");
        assert_eq!(id_label(&packet), "-");
        assert_eq!(id_label(&packet.with_id(9u16)), "9");
    }
}
