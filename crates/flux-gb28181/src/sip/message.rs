// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式
//
// 消息体保持原始字节：MANSCDP 报文常用 GB2312 编码，交给 XML 层按声明的字符集解码。

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

use crate::auth::DigestAuthorization;
use crate::config::Network;
use crate::error::{Gb28181Error, Result};

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SipMethod {
    type Err = Gb28181Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "MESSAGE" => Ok(SipMethod::Message),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "NOTIFY" => Ok(SipMethod::Notify),
            "INFO" => Ok(SipMethod::Info),
            "OPTIONS" => Ok(SipMethod::Options),
            other => Err(Gb28181Error::SipParse(format!("Unknown method: {}", other))),
        }
    }
}

/// 紧凑头名展开（RFC 3261 7.3.3）
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "e" | "E" => "Content-Encoding",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "f" | "F" => "From",
        "s" | "S" => "Subject",
        "k" | "K" => "Supported",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        other => other,
    }
}

/// 有序头部列表
///
/// 保留原始顺序和重复项（多个 Via），按名称查找时不区分大小写。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一个同名头的值
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = expand_compact(name);
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let name = expand_compact(name);
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 追加头部
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换同名头部（不存在则追加）
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((expand_compact(name).to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        let name = expand_compact(name);
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut headers = Headers::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // 折行，拼接到上一个头部
                if let Some((_, value)) = headers.0.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some(pos) = line.find(':') {
                let key = expand_compact(line[..pos].trim()).to_string();
                let value = line[pos + 1..].trim().to_string();
                headers.0.push((key, value));
            }
        }
        headers
    }

    /// 解析完整的消息头部文本（首行为请求行或状态行）
    pub(crate) fn parse_head(head: &str) -> Self {
        Self::parse_lines(lines(head).skip_while(|l| l.is_empty()).skip(1))
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (key, value) in &self.0 {
            if key.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    /// 头部中声明的 Content-Length
    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")?.trim().parse().ok()
    }
}

/// 从 `<sip:user@host>` 形式的地址中取出 user 部分
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:").map(|i| i + 4).or_else(|| {
        value.find("sips:").map(|i| i + 5)
    })?;
    let rest = &value[start..];
    let end = rest.find(&['@', ';', '>', ':'][..]).unwrap_or(rest.len());
    let user = &rest[..end];
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// 拆出头部与消息体（按 Content-Length 截断消息体）
fn split_message(data: &[u8]) -> Result<(String, Bytes)> {
    let (head, body) = match find_subslice(data, b"\r\n\r\n") {
        Some(pos) => (&data[..pos], &data[pos + 4..]),
        None => match find_subslice(data, b"\n\n") {
            Some(pos) => (&data[..pos], &data[pos + 2..]),
            None => (data, &[][..]),
        },
    };

    let head = String::from_utf8_lossy(head).into_owned();
    if head.trim().is_empty() {
        return Err(Gb28181Error::SipParse("Empty SIP message".to_string()));
    }

    Ok((head, Bytes::copy_from_slice(body)))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn truncate_body(body: Bytes, headers: &Headers) -> Bytes {
    match headers.content_length() {
        Some(len) if len < body.len() => body.slice(..len),
        _ => body,
    }
}

fn lines(head: &str) -> impl Iterator<Item = &str> {
    head.split('\n').map(|l| l.trim_end_matches('\r'))
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.add(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    /// From 头中的用户部分（GB28181 中即设备编码）
    pub fn from_user(&self) -> Option<&str> {
        self.headers.get("From").and_then(uri_user)
    }

    /// 顶层 Via 声明的传输协议
    pub fn via_transport(&self) -> Option<Network> {
        self.headers.get("Via").and_then(Network::from_via)
    }

    pub fn authorization(&self) -> Option<DigestAuthorization> {
        self.headers
            .get("Authorization")
            .and_then(DigestAuthorization::parse)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// 序列化，自动写入 Content-Length
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
        self.headers.write_to(&mut buf);
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// 从原始字节解析 SIP 请求
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = split_message(data)?;
        let mut lines = lines(&head).skip_while(|l| l.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| Gb28181Error::SipParse("Missing request line".to_string()))?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Gb28181Error::SipParse(format!(
                "Invalid request line: {}",
                request_line
            )));
        }

        let method = parts[0].parse()?;
        let headers = Headers::parse_lines(lines);
        let body = truncate_body(body, &headers);

        Ok(Self {
            method,
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
        })
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// 基于请求构造响应，复制 Via/From/To/Call-ID/CSeq
    pub fn from_request(req: &SipRequest, status_code: u16, reason_phrase: &str) -> Self {
        let mut resp = Self::new(status_code, reason_phrase);
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in req.headers.get_all(key) {
                resp.headers.add(key, value);
            }
        }
        resp
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.add(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    /// 给 To 头加上 tag（已有 tag 时替换）
    pub fn set_to_tag(&mut self, tag: &str) {
        let Some(to) = self.headers.get("To") else {
            return;
        };
        let base = match to.find(";tag=") {
            Some(pos) => &to[..pos],
            None => to,
        };
        let value = format!("{};tag={}", base, tag);
        self.headers.set("To", value);
    }

    pub fn to_tag(&self) -> Option<&str> {
        let to = self.headers.get("To")?;
        let start = to.find(";tag=")? + 5;
        let rest = &to[start..];
        Some(rest.split(';').next().unwrap_or(rest))
    }

    /// 序列化，自动写入 Content-Length
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(
            format!("{} {} {}\r\n", self.version, self.status_code, self.reason_phrase).as_bytes(),
        );
        self.headers.write_to(&mut buf);
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// 从原始字节解析 SIP 响应
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = split_message(data)?;
        let mut lines = lines(&head).skip_while(|l| l.is_empty());

        let status_line = lines
            .next()
            .ok_or_else(|| Gb28181Error::SipParse("Missing status line".to_string()))?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(Gb28181Error::SipParse(format!(
                "Invalid status line: {}",
                status_line
            )));
        }

        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| Gb28181Error::SipParse("Invalid status code".to_string()))?;
        let headers = Headers::parse_lines(lines);
        let body = truncate_body(body, &headers);

        Ok(Self {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts.get(2).copied().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从原始字节解析 SIP 消息
    pub fn parse(data: &[u8]) -> Result<Self> {
        let start = data
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(data.len());
        if data[start..].starts_with(b"SIP/") {
            Ok(SipMessage::Response(SipResponse::parse(data)?))
        } else {
            Ok(SipMessage::Request(SipRequest::parse(data)?))
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
