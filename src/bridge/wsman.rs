//! WS-Management envelopes for the remote shell protocol and the minimal
//! response parsing the bridge needs.
//!
//! Parsing is namespace-prefix agnostic: servers are free to choose their own
//! prefixes, so elements are matched on their local name only.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use uuid::Uuid;

use super::error::BridgeError;
use super::types::TransportCause;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const IDENTITY_NS: &str = "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd";
const ANONYMOUS_ADDRESS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

pub(crate) const SHELL_RESOURCE_URI: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

pub(crate) const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
pub(crate) const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
pub(crate) const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
pub(crate) const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
pub(crate) const ACTION_SIGNAL: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WS-Man fault raised when a Receive finds no output within the operation
/// timeout. Not an error: the command is still running.
pub(crate) const OPERATION_TIMEOUT_FAULT: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;
const OPERATION_TIMEOUT: &str = "PT20S";
const CODEPAGE_UTF8: u32 = 65001;

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Decode the five predefined XML entities plus numeric character references.
pub(crate) fn xml_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

struct Header<'a> {
    to: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, String)],
}

impl Header<'_> {
    fn render(&self) -> String {
        let selector = self
            .shell_id
            .map(|id| {
                format!(
                    "\n    <w:SelectorSet>\n      <w:Selector Name=\"ShellId\">{}</w:Selector>\n    </w:SelectorSet>",
                    xml_escape(id)
                )
            })
            .unwrap_or_default();
        let options = if self.options.is_empty() {
            String::new()
        } else {
            let items: String = self
                .options
                .iter()
                .map(|(name, value)| {
                    format!("\n      <w:Option Name=\"{}\">{}</w:Option>", name, xml_escape(value))
                })
                .collect();
            format!("\n    <w:OptionSet>{}\n    </w:OptionSet>", items)
        };
        format!(
            r#"  <s:Header>
    <a:To>{to}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>{selector}{options}
  </s:Header>"#,
            to = xml_escape(self.to),
            action = self.action,
            id = Uuid::new_v4(),
        )
    }
}

fn shell_envelope(header: Header<'_>, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
{}
  <s:Body>{}</s:Body>
</s:Envelope>"#,
        header.render(),
        body
    )
}

/// Identify request used as the authentication handshake.
pub(crate) fn identify() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:wsmid="{IDENTITY_NS}">
  <s:Header/>
  <s:Body>
    <wsmid:Identify/>
  </s:Body>
</s:Envelope>"#
    )
}

pub(crate) fn create_shell(to: &str) -> String {
    let options = [
        ("WINRS_NOPROFILE", "FALSE".to_string()),
        ("WINRS_CODEPAGE", CODEPAGE_UTF8.to_string()),
    ];
    shell_envelope(
        Header {
            to,
            action: ACTION_CREATE,
            shell_id: None,
            options: &options,
        },
        r#"
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>
  "#,
    )
}

pub(crate) fn command(to: &str, shell_id: &str, program: &str, args: &[String]) -> String {
    let options = [
        ("WINRS_CONSOLEMODE_STDIN", "TRUE".to_string()),
        ("WINRS_SKIP_CMD_SHELL", "FALSE".to_string()),
    ];
    let args_xml: String = args
        .iter()
        .map(|arg| format!("\n      <rsp:Arguments>{}</rsp:Arguments>", xml_escape(arg)))
        .collect();
    shell_envelope(
        Header {
            to,
            action: ACTION_COMMAND,
            shell_id: Some(shell_id),
            options: &options,
        },
        &format!(
            "\n    <rsp:CommandLine>\n      <rsp:Command>{}</rsp:Command>{}\n    </rsp:CommandLine>\n  ",
            xml_escape(program),
            args_xml
        ),
    )
}

pub(crate) fn receive(to: &str, shell_id: &str, command_id: &str) -> String {
    shell_envelope(
        Header {
            to,
            action: ACTION_RECEIVE,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            "\n    <rsp:Receive>\n      <rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream>\n    </rsp:Receive>\n  ",
            xml_escape(command_id)
        ),
    )
}

pub(crate) fn signal_terminate(to: &str, shell_id: &str, command_id: &str) -> String {
    shell_envelope(
        Header {
            to,
            action: ACTION_SIGNAL,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            "\n    <rsp:Signal CommandId=\"{}\">\n      <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>\n    </rsp:Signal>\n  ",
            xml_escape(command_id)
        ),
    )
}

pub(crate) fn delete_shell(to: &str, shell_id: &str) -> String {
    shell_envelope(
        Header {
            to,
            action: ACTION_DELETE,
            shell_id: Some(shell_id),
            options: &[],
        },
        "",
    )
}

/// One element located by local name.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Element<'a> {
    attrs: &'a str,
    text: &'a str,
}

impl<'a> Element<'a> {
    pub(crate) fn text(&self) -> &'a str {
        self.text.trim()
    }

    pub(crate) fn attr(&self, name: &str) -> Option<&'a str> {
        let mut rest = self.attrs;
        while let Some(pos) = rest.find(name) {
            let preceded_ok = pos == 0
                || rest[..pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_whitespace() || c == ':');
            let after = &rest[pos + name.len()..];
            if preceded_ok && let Some(value) = after.strip_prefix("=\"") {
                return value.find('"').map(|end| &value[..end]);
            }
            rest = after;
        }
        None
    }
}

/// Every element whose local name is `local`, in document order.
pub(crate) fn elements<'a>(xml: &'a str, local: &str) -> Vec<Element<'a>> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = xml[pos..].find('<') {
        let start = pos + offset + 1;
        pos = start;
        let tag_end = match xml[start..].find('>') {
            Some(e) => start + e,
            None => break,
        };
        let tag = &xml[start..tag_end];
        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        let name_end = tag
            .find(|c: char| c.is_whitespace() || c == '/')
            .unwrap_or(tag.len());
        let name = &tag[..name_end];
        let local_name = name.rsplit(':').next().unwrap_or(name);
        if local_name != local {
            continue;
        }
        let self_closing = tag.ends_with('/');
        let attrs = tag[name_end..].trim_end_matches('/');
        if self_closing {
            found.push(Element { attrs, text: "" });
            pos = tag_end + 1;
            continue;
        }
        let content_start = tag_end + 1;
        let close = format!("</{}>", name);
        match xml[content_start..].find(&close) {
            Some(end) => {
                found.push(Element {
                    attrs,
                    text: &xml[content_start..content_start + end],
                });
                pos = content_start + end + close.len();
            }
            None => break,
        }
    }
    found
}

pub(crate) fn first<'a>(xml: &'a str, local: &str) -> Option<Element<'a>> {
    elements(xml, local).into_iter().next()
}

fn protocol(message: impl Into<String>) -> BridgeError {
    BridgeError::transport(TransportCause::Protocol, message)
}

/// Shell id from a Create reply.
pub(crate) fn parse_shell_id(xml: &str) -> Result<String, BridgeError> {
    if let Some(el) = first(xml, "ShellId") {
        return Ok(el.text().to_string());
    }
    elements(xml, "Selector")
        .into_iter()
        .find(|el| el.attr("Name") == Some("ShellId"))
        .map(|el| el.text().to_string())
        .ok_or_else(|| protocol("Create reply carried no ShellId"))
}

/// Command id from a Command reply.
pub(crate) fn parse_command_id(xml: &str) -> Result<String, BridgeError> {
    first(xml, "CommandId")
        .map(|el| el.text().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| protocol("Command reply carried no CommandId"))
}

/// Output of one Receive round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReceiveChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub done: bool,
}

pub(crate) fn parse_receive(xml: &str) -> Result<ReceiveChunk, BridgeError> {
    let mut chunk = ReceiveChunk::default();
    for stream in elements(xml, "Stream") {
        let content = stream.text();
        if content.is_empty() {
            continue;
        }
        let decoded = BASE64
            .decode(content)
            .map_err(|e| protocol(format!("undecodable stream content: {}", e)))?;
        match stream.attr("Name") {
            Some("stdout") => chunk.stdout.extend_from_slice(&decoded),
            Some("stderr") => chunk.stderr.extend_from_slice(&decoded),
            _ => {}
        }
    }
    if let Some(state) = first(xml, "CommandState") {
        chunk.done = state.attr("State").is_some_and(|s| s.ends_with("Done"));
    }
    if let Some(code) = first(xml, "ExitCode") {
        let code = code
            .text()
            .parse::<i64>()
            .map_err(|_| protocol(format!("invalid ExitCode {:?}", code.text())))?;
        // Windows exit codes are DWORDs; keep the signed view
        chunk.exit_code = Some(code as i32);
    }
    Ok(chunk)
}

/// Whether `xml` is a SOAP fault.
pub(crate) fn is_fault(xml: &str) -> bool {
    first(xml, "Fault").is_some()
}

/// Whether `xml` is the operation-timeout fault of an empty Receive round.
pub(crate) fn is_operation_timeout(xml: &str) -> bool {
    is_fault(xml)
        && (elements(xml, "WSManFault")
            .iter()
            .any(|f| f.attr("Code") == Some(OPERATION_TIMEOUT_FAULT))
            || xml.contains("w:TimedOut"))
}

/// Whether `xml` is a fault refusing a request for travelling unencrypted.
pub(crate) fn is_unencrypted_refusal(xml: &str) -> bool {
    is_fault(xml) && fault_message(xml).to_lowercase().contains("unencrypted")
}

/// Human-readable summary of a SOAP fault.
pub(crate) fn fault_message(xml: &str) -> String {
    let reason = first(xml, "Message")
        .or_else(|| first(xml, "Text"))
        .map(|el| xml_unescape(el.text()))
        .unwrap_or_else(|| "unspecified fault".to_string());
    match elements(xml, "WSManFault")
        .into_iter()
        .find_map(|f| f.attr("Code"))
    {
        Some(code) => format!("{} (code {})", reason, code),
        None => reason,
    }
}
