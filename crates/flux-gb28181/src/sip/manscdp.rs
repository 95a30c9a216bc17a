// MANSCDP 报文（GB28181 附录 A）
// 解析设备上报的 XML 消息体，并生成平台下发的查询/订阅/应答报文

use encoding_rs::{Encoding, GBK, UTF_8};
use quick_xml::de::from_str;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Gb28181Error, Result};

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// 命令类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdType {
    Keepalive,
    Catalog,
    RecordInfo,
    DeviceInfo,
    Alarm,
    MobilePosition,
    /// 未识别的命令（包括解码失败后的空 CmdType）
    Unrecognized(String),
}

impl From<&str> for CmdType {
    fn from(s: &str) -> Self {
        match s.trim() {
            "Keepalive" => CmdType::Keepalive,
            "Catalog" => CmdType::Catalog,
            "RecordInfo" => CmdType::RecordInfo,
            "DeviceInfo" => CmdType::DeviceInfo,
            "Alarm" => CmdType::Alarm,
            "MobilePosition" => CmdType::MobilePosition,
            other => CmdType::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdType::Keepalive => f.write_str("Keepalive"),
            CmdType::Catalog => f.write_str("Catalog"),
            CmdType::RecordInfo => f.write_str("RecordInfo"),
            CmdType::DeviceInfo => f.write_str("DeviceInfo"),
            CmdType::Alarm => f.write_str("Alarm"),
            CmdType::MobilePosition => f.write_str("MobilePosition"),
            CmdType::Unrecognized(s) => write!(f, "Unrecognized({})", s),
        }
    }
}

/// 数值字段的宽松解析：空元素或纯空白视为缺省
///
/// 不少设备会发送 `<SN></SN>`、`<Longitude></Longitude>` 这样的空元素。
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let text: Option<String> = Option::deserialize(deserializer)?;
    match text.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// MANSCDP 消息根节点（Notify / Response / Query 通用）
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ManscdpMessage {
    /// 命令类型（原始文本）
    #[serde(rename = "CmdType")]
    pub cmd_type: String,

    /// 序列号
    #[serde(rename = "SN", default, deserialize_with = "lenient")]
    pub sn: Option<u32>,

    /// 设备 ID（RecordInfo/MobilePosition 中为通道 ID）
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    /// 目录总数
    #[serde(default, deserialize_with = "lenient")]
    pub sum_num: Option<u32>,

    /// 设备列表（Catalog）
    pub device_list: Option<ItemList<CatalogItem>>,

    /// 录像列表（RecordInfo）
    pub record_list: Option<ItemList<RecordItem>>,

    /// 设备名称（DeviceInfo）
    pub device_name: String,

    /// 制造商（DeviceInfo）
    pub manufacturer: String,

    /// 型号（DeviceInfo）
    pub model: String,

    /// 固件版本（DeviceInfo）
    pub firmware: String,

    /// 上报时间（MobilePosition）
    pub time: String,

    /// 经度（MobilePosition）
    #[serde(default, deserialize_with = "lenient")]
    pub longitude: Option<f64>,

    /// 纬度（MobilePosition）
    #[serde(default, deserialize_with = "lenient")]
    pub latitude: Option<f64>,

    /// 报警级别（Alarm）
    pub alarm_priority: String,

    /// 报警方式（Alarm）
    pub alarm_method: String,

    /// 报警时间（Alarm）
    pub alarm_time: String,

    /// 报警描述（Alarm）
    pub alarm_description: String,
}

impl ManscdpMessage {
    pub fn cmd(&self) -> CmdType {
        CmdType::from(self.cmd_type.as_str())
    }

    /// 目录项（没有 DeviceList 时为空）
    pub fn catalog_items(&self) -> &[CatalogItem] {
        self.device_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }

    pub fn record_items(&self) -> &[RecordItem] {
        self.record_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }
}

/// 带 Num 属性的列表
#[derive(Debug, Deserialize, PartialEq)]
pub struct ItemList<T> {
    /// 列表数量（作为属性）
    #[serde(rename = "@Num", default, deserialize_with = "lenient")]
    pub num: Option<u32>,

    #[serde(rename = "Item", default = "Vec::new")]
    pub items: Vec<T>,
}

/// 目录项（通道信息），也用于目录变更通知
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogItem {
    /// 通道 ID
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,

    /// 是否有子设备（1-有，0-没有）
    #[serde(default, deserialize_with = "lenient")]
    pub parental: Option<u8>,

    #[serde(rename = "ParentID")]
    pub parent_id: String,

    #[serde(default, deserialize_with = "lenient")]
    pub safety_way: Option<u8>,
    #[serde(default, deserialize_with = "lenient")]
    pub register_way: Option<u8>,
    #[serde(default, deserialize_with = "lenient")]
    pub secrecy: Option<u8>,

    /// 状态（ON/OFF）
    pub status: String,

    #[serde(default, deserialize_with = "lenient")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub latitude: Option<f64>,

    /// 目录通知事件（ON/OFF/VLOST/DEFECT/ADD/DEL/UPDATE）
    pub event: String,
}

/// 录像文件项
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RecordItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub name: String,
    pub file_path: String,
    pub address: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, deserialize_with = "lenient")]
    pub secrecy: Option<u8>,
    #[serde(rename = "Type")]
    pub record_type: String,
    #[serde(rename = "RecorderID")]
    pub recorder_id: String,
}

/// 解码消息体
///
/// 先按 XML 声明中的字符集（缺省 UTF-8）解码；解码或解析失败时按 GBK 再试一次。
pub fn decode(body: &[u8]) -> Result<ManscdpMessage> {
    let declared = declared_encoding(body).unwrap_or(UTF_8);

    match decode_with(declared, body) {
        Ok(msg) => Ok(msg),
        Err(first) if declared != GBK => {
            tracing::debug!(
                target: "gb28181::sip",
                encoding = declared.name(),
                error = %first,
                "MANSCDP decode failed, retrying as GBK"
            );
            decode_with(GBK, body)
        }
        Err(e) => Err(e),
    }
}

fn decode_with(encoding: &'static Encoding, body: &[u8]) -> Result<ManscdpMessage> {
    let text = encoding
        .decode_without_bom_handling_and_without_replacement(strip_bom(body))
        .ok_or_else(|| {
            Gb28181Error::XmlDecode(format!("body is not valid {}", encoding.name()))
        })?;

    from_str(text.trim()).map_err(|e| Gb28181Error::XmlDecode(e.to_string()))
}

fn strip_bom(body: &[u8]) -> &[u8] {
    body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body)
}

/// 从 `<?xml ... encoding="..."?>` 中取字符集
fn declared_encoding(body: &[u8]) -> Option<&'static Encoding> {
    let body = strip_bom(body);
    let head = &body[..body.len().min(256)];
    let end = head.windows(2).position(|w| w == b"?>")?;
    let decl = std::str::from_utf8(&head[..end]).ok()?;
    if !decl.trim_start().starts_with("<?xml") {
        return None;
    }

    let rest = &decl[decl.find("encoding")? + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let label = &rest[..rest.find(quote)?];

    Encoding::for_label(label.trim().as_bytes())
}

/// 目录查询（MESSAGE）与目录订阅（SUBSCRIBE）共用的报文
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>Catalog</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
</Query>"#,
        sn, device_id
    )
}

/// 设备信息查询
pub fn device_info_query(sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>DeviceInfo</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
</Query>"#,
        sn, device_id
    )
}

/// 移动位置订阅
pub fn mobile_position_query(sn: u32, device_id: &str, interval_secs: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>MobilePosition</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Interval>{}</Interval>
</Query>"#,
        sn, device_id, interval_secs
    )
}

/// 报警通知应答
pub fn alarm_response(sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Alarm</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Result>OK</Result>
</Response>"#,
        sn, device_id
    )
}
