// SIP 请求分发
// 按方法和 CmdType 把设备请求路由到注册表与目录同步器，并构造应答

use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

use super::manscdp::{self, CmdType, ManscdpMessage, CONTENT_TYPE};
use super::message::{SipMethod, SipRequest, SipResponse};
use crate::auth::{random_digits, www_authenticate, Authenticator};
use crate::config::{GatewayConfig, Network};
use crate::device::{Device, DeviceBinding, DeviceStatus, Record};
use crate::registry::DeviceRegistry;
use crate::sync::CatalogSynchronizer;

/// 国标编码长度
pub const DEVICE_ID_LEN: usize = 20;

/// REGISTER 应答中的有效期（秒）
const REGISTER_EXPIRES: u32 = 3600;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct SipDispatcher {
    config: Arc<GatewayConfig>,
    devices: Arc<DeviceRegistry>,
    sync: Arc<CatalogSynchronizer>,
    authenticator: Authenticator,
}

impl SipDispatcher {
    pub fn new(
        config: Arc<GatewayConfig>,
        devices: Arc<DeviceRegistry>,
        sync: Arc<CatalogSynchronizer>,
    ) -> Self {
        Self {
            config,
            devices,
            sync,
            authenticator: Authenticator::default(),
        }
    }

    /// 处理一条请求，返回需要回给设备的应答（None 表示不应答）
    pub async fn handle(
        &self,
        req: &SipRequest,
        source: SocketAddr,
        transport: Network,
    ) -> Option<SipResponse> {
        let span = tracing::info_span!(
            "gb28181.sip.request",
            method = %req.method,
            remote = %source,
            transport = %transport
        );

        async {
            let binding = DeviceBinding::new(source, transport);
            match req.method {
                SipMethod::Register => self.handle_register(req, binding).await,
                SipMethod::Message => self.handle_message(req, binding).await,
                SipMethod::Notify => self.handle_notify(req).await,
                SipMethod::Bye => Some(SipResponse::from_request(req, 200, "OK")),
                SipMethod::Ack => None,
                other => {
                    tracing::debug!(target: "gb28181::sip", method = %other, "Unsupported SIP method");
                    Some(SipResponse::from_request(req, 405, "Method Not Allowed"))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 处理 REGISTER 请求（设备注册）
    async fn handle_register(&self, req: &SipRequest, binding: DeviceBinding) -> Option<SipResponse> {
        let Some(device_id) = req.from_user() else {
            tracing::warn!(target: "gb28181::sip", "REGISTER without From user");
            return None;
        };
        if device_id.len() != DEVICE_ID_LEN {
            tracing::info!(target: "gb28181::sip", %device_id, "Wrong GB28181 device id length");
            return None;
        }

        let auth = &self.config.auth;
        if auth.is_required() {
            if self.devices.is_banned(device_id) {
                tracing::warn!(target: "gb28181::sip", %device_id, "REGISTER rejected, too many failed attempts");
                return Some(SipResponse::from_request(req, 403, "Forbidden"));
            }

            let (nonce, authorization) = match (self.devices.nonce(device_id), req.authorization()) {
                (Some(nonce), Some(authorization)) => (nonce, authorization),
                _ => {
                    let nonce = self.devices.challenge(device_id);
                    tracing::debug!(target: "gb28181::sip", %device_id, "Sending digest challenge");
                    return Some(self.unauthorized(req, &nonce));
                }
            };

            let username = if authorization.username == device_id {
                device_id
            } else {
                auth.username.as_str()
            };

            let verified = self.authenticator.verify(
                username,
                &auth.password,
                &auth.realm,
                &nonce,
                req.method.as_str(),
                &authorization.uri,
                &authorization.response,
            );

            if !verified {
                let attempts = self.devices.record_failed_attempt(device_id);
                tracing::warn!(target: "gb28181::sip", %device_id, attempts, "REGISTER digest auth failed");
                return Some(self.unauthorized(req, &nonce));
            }

            self.devices.clear_challenge(device_id);
        }

        let device = self.devices.register_or_recover(device_id, binding).await;

        let mut resp = SipResponse::from_request(req, 200, "OK");
        resp.set_to_tag(&random_digits(9));
        resp.add_header("Expires", REGISTER_EXPIRES.to_string());
        resp.add_header("Date", Local::now().format(DATE_FORMAT).to_string());

        self.sync.spawn_sync(device);
        Some(resp)
    }

    fn unauthorized(&self, req: &SipRequest, nonce: &str) -> SipResponse {
        let mut resp = SipResponse::from_request(req, 401, "Unauthorized");
        resp.add_header("WWW-Authenticate", www_authenticate(&self.config.auth.realm, nonce));
        resp
    }

    /// 处理 MESSAGE 请求（心跳、目录、录像、设备信息、报警）
    async fn handle_message(&self, req: &SipRequest, binding: DeviceBinding) -> Option<SipResponse> {
        let device = self.known_device(req)?;

        device
            .mark_recover_if_stale(self.config.heartbeat_interval() * 3)
            .await;
        match device.status().await {
            DeviceStatus::Recover | DeviceStatus::Offline => {
                tracing::info!(target: "gb28181::sip", device_id = %device.id(), "Recovering device");
                device.recover(binding).await;
                self.sync.spawn_sync(device.clone());
            }
            DeviceStatus::Registering => device.set_status(DeviceStatus::Online).await,
            DeviceStatus::Online | DeviceStatus::Alarmed => {}
        }
        device.touch().await;

        let msg = self.decode_body(req, &device);
        let mut resp = SipResponse::from_request(req, 200, "OK");

        match msg.cmd() {
            CmdType::Keepalive => {
                device.stamp_keepalive().await;
                if device.channel_count().await == 0 {
                    self.sync.spawn_sync(device.clone());
                } else {
                    self.sync.spawn_auto_invite(device.clone());
                }
                self.sync.spawn_position_subscribe(device);
            }
            CmdType::Catalog => {
                self.sync.apply_catalog(&device, msg.catalog_items()).await;
            }
            CmdType::RecordInfo => {
                let records = msg.record_items().iter().map(Record::from).collect();
                if !self.sync.apply_records(&device, &msg.device_id, records).await {
                    tracing::debug!(
                        target: "gb28181::sip",
                        channel_id = %msg.device_id,
                        "RecordInfo for unknown channel"
                    );
                }
            }
            CmdType::DeviceInfo => {
                self.sync
                    .apply_device_info(&device, &msg.device_name, &msg.manufacturer, &msg.model)
                    .await;
            }
            CmdType::Alarm => {
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %device.id(),
                    priority = %msg.alarm_priority,
                    method = %msg.alarm_method,
                    description = %msg.alarm_description,
                    "Device alarm"
                );
                device.set_status(DeviceStatus::Alarmed).await;
                resp.set_body(CONTENT_TYPE, manscdp::alarm_response(msg.sn.unwrap_or(0), &msg.device_id));
            }
            other => {
                tracing::debug!(target: "gb28181::sip", cmd_type = %other, "Unhandled MESSAGE");
                return Some(SipResponse::from_request(req, 400, "Bad Request"));
            }
        }

        Some(resp)
    }

    /// 处理 NOTIFY 请求（目录变更、移动位置）
    async fn handle_notify(&self, req: &SipRequest) -> Option<SipResponse> {
        let device = self.known_device(req)?;
        device.touch().await;

        let msg = self.decode_body(req, &device);
        match msg.cmd() {
            CmdType::Catalog => {
                self.sync.apply_channel_status(&device, msg.catalog_items()).await;
            }
            CmdType::MobilePosition => match (msg.longitude, msg.latitude) {
                (Some(longitude), Some(latitude)) => {
                    self.sync
                        .apply_position(&device, &msg.device_id, &msg.time, longitude, latitude)
                        .await;
                }
                _ => {
                    tracing::warn!(target: "gb28181::sip", device_id = %device.id(), "MobilePosition without coordinates");
                }
            },
            other => {
                tracing::debug!(target: "gb28181::sip", cmd_type = %other, "Unhandled NOTIFY");
                return Some(SipResponse::from_request(req, 400, "Bad Request"));
            }
        }

        Some(SipResponse::from_request(req, 200, "OK"))
    }

    fn known_device(&self, req: &SipRequest) -> Option<Arc<Device>> {
        let device_id = req.from_user()?;
        let device = self.devices.find(device_id);
        if device.is_none() {
            tracing::debug!(target: "gb28181::sip", %device_id, method = %req.method, "Request from unknown device dropped");
        }
        device
    }

    fn decode_body(&self, req: &SipRequest, device: &Device) -> ManscdpMessage {
        match manscdp::decode(&req.body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(
                    target: "gb28181::sip",
                    device_id = %device.id(),
                    "Failed to decode MANSCDP body: {}",
                    e
                );
                ManscdpMessage::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::sync::tests::RecordingQuerier;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ID: &str = "34020000001320000001";
    const URI: &str = "sip:34020000002000000001@3402000000";

    struct Harness {
        dispatcher: SipDispatcher,
        devices: Arc<DeviceRegistry>,
        querier: Arc<RecordingQuerier>,
        calls: mpsc::UnboundedReceiver<String>,
    }

    fn harness(config: GatewayConfig) -> Harness {
        let config = Arc::new(config);
        let (querier, calls) = RecordingQuerier::new(true);
        let devices = Arc::new(DeviceRegistry::new(config.auth.max_register_count));
        let sync = Arc::new(CatalogSynchronizer::new(querier.clone(), &config));
        Harness {
            dispatcher: SipDispatcher::new(config, devices.clone(), sync),
            devices,
            querier,
            calls,
        }
    }

    fn with_auth() -> GatewayConfig {
        GatewayConfig {
            auth: AuthConfig {
                username: "admin".to_string(),
                password: "12345678".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn source() -> SocketAddr {
        "192.168.1.64:5060".parse().unwrap()
    }

    fn register(device_id: &str, authorization: Option<String>) -> SipRequest {
        let mut raw = format!(
            "REGISTER {} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.64:5060;branch=z9hG4bK1\r\n\
             From: <sip:{}@3402000000>;tag=1\r\n\
             To: <sip:{}@3402000000>\r\n\
             Call-ID: 1\r\n\
             CSeq: 1 REGISTER\r\n\
             Expires: 3600\r\n",
            URI, device_id, device_id
        );
        if let Some(a) = authorization {
            raw.push_str(&format!("Authorization: {}\r\n", a));
        }
        raw.push_str("Content-Length: 0\r\n\r\n");
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    fn request(method: &str, device_id: &str, body: &str) -> SipRequest {
        let raw = format!(
            "{} {} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.64:5060;branch=z9hG4bK2\r\n\
             From: <sip:{}@3402000000>;tag=2\r\n\
             To: <sip:34020000002000000001@3402000000>\r\n\
             Call-ID: 2\r\n\
             CSeq: 2 {}\r\n\
             Content-Type: Application/MANSCDP+xml\r\n\
             Content-Length: {}\r\n\r\n{}",
            method,
            URI,
            device_id,
            method,
            body.len(),
            body
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    fn digest(user: &str, password: &str, nonce: &str) -> String {
        let auth = Authenticator::default();
        let ha1 = auth.digest(&format!("{}:3402000000:{}", user, password));
        let ha2 = auth.digest(&format!("REGISTER:{}", URI));
        let response = auth.digest(&format!("{}:{}:{}", ha1, nonce, ha2));
        format!(
            r#"Digest username="{}",realm="3402000000",nonce="{}",uri="{}",response="{}",algorithm=MD5"#,
            user, nonce, URI, response
        )
    }

    fn nonce_of(resp: &SipResponse) -> String {
        let header = resp.headers.get("WWW-Authenticate").unwrap();
        let start = header.find("nonce=\"").unwrap() + 7;
        header[start..start + 32].to_string()
    }

    async fn expect_call(calls: &mut mpsc::UnboundedReceiver<String>, expected: &str) {
        loop {
            let call = tokio::time::timeout(Duration::from_secs(2), calls.recv())
                .await
                .expect("timed out waiting for outbound request")
                .expect("querier dropped");
            if call == expected {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_device_id_gets_no_reply() {
        let h = harness(GatewayConfig::default());
        let resp = h.dispatcher.handle(&register("12345", None), source(), Network::Udp).await;
        assert!(resp.is_none());
        assert_eq!(h.devices.device_count(), 0);
    }

    #[tokio::test]
    async fn test_register_without_credentials_configured() {
        let mut h = harness(GatewayConfig::default());
        let resp = h
            .dispatcher
            .handle(&register(ID, None), source(), Network::Udp)
            .await
            .unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.headers.get("Expires"), Some("3600"));
        assert_eq!(resp.to_tag().map(str::len), Some(9));
        assert!(resp.headers.contains("Date"));
        assert!(h.devices.find(ID).is_some());

        expect_call(&mut h.calls, &format!("catalog:{}", ID)).await;
    }

    #[tokio::test]
    async fn test_challenge_then_success() {
        let h = harness(with_auth());

        let first = h.dispatcher.handle(&register(ID, None), source(), Network::Udp).await.unwrap();
        assert_eq!(first.status_code, 401);
        let nonce = nonce_of(&first);
        assert!(first.headers.get("WWW-Authenticate").unwrap().starts_with("Digest realm=\"3402000000\",algorithm=MD5,nonce=\""));

        // 未完成的挑战重复请求返回同一个 nonce
        let again = h.dispatcher.handle(&register(ID, None), source(), Network::Udp).await.unwrap();
        assert_eq!(nonce_of(&again), nonce);

        let resp = h
            .dispatcher
            .handle(&register(ID, Some(digest(ID, "12345678", &nonce))), source(), Network::Udp)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(h.devices.nonce(ID), None);
    }

    #[tokio::test]
    async fn test_configured_account_name_is_used() {
        let h = harness(with_auth());
        let nonce = nonce_of(&h.dispatcher.handle(&register(ID, None), source(), Network::Udp).await.unwrap());

        let resp = h
            .dispatcher
            .handle(&register(ID, Some(digest("admin", "12345678", &nonce))), source(), Network::Udp)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn test_wrong_password_then_ban() {
        let h = harness(with_auth());
        let nonce = nonce_of(&h.dispatcher.handle(&register(ID, None), source(), Network::Udp).await.unwrap());

        for attempt in 1..=4u32 {
            let resp = h
                .dispatcher
                .handle(&register(ID, Some(digest(ID, "wrong", &nonce))), source(), Network::Udp)
                .await
                .unwrap();
            assert_eq!(resp.status_code, 401);
            assert_eq!(nonce_of(&resp), nonce);
            assert_eq!(h.devices.attempts(ID), attempt);
        }

        // 正确的凭据也被拒绝，且不签发新 nonce
        let resp = h
            .dispatcher
            .handle(&register(ID, Some(digest(ID, "12345678", &nonce))), source(), Network::Udp)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 403);
        assert!(!resp.headers.contains("WWW-Authenticate"));
        assert_eq!(h.devices.nonce(ID), Some(nonce.clone()));
        assert!(h.devices.find(ID).is_none());

        h.devices.sweep_bans();
        let resp = h
            .dispatcher
            .handle(&register(ID, Some(digest(ID, "12345678", &nonce))), source(), Network::Udp)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn test_message_from_unknown_device_is_dropped() {
        let h = harness(GatewayConfig::default());
        let body = "<Notify><CmdType>Keepalive</CmdType><SN>1</SN><DeviceID>34020000001320000009</DeviceID></Notify>";
        let resp = h
            .dispatcher
            .handle(&request("MESSAGE", "34020000001320000009", body), source(), Network::Udp)
            .await;
        assert!(resp.is_none());

        let resp = h
            .dispatcher
            .handle(&request("NOTIFY", "34020000001320000009", body), source(), Network::Udp)
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_first_message_promotes_to_online() {
        let h = harness(GatewayConfig::default());
        h.dispatcher.handle(&register(ID, None), source(), Network::Udp).await;
        let device = h.devices.find(ID).unwrap();
        assert_eq!(device.status().await, DeviceStatus::Registering);

        let body = format!("<Notify><CmdType>Keepalive</CmdType><SN>1</SN><DeviceID>{}</DeviceID></Notify>", ID);
        let resp = h
            .dispatcher
            .handle(&request("MESSAGE", ID, &body), source(), Network::Udp)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(device.status().await, DeviceStatus::Online);
        assert!(device.snapshot().await.last_keepalive.is_some());
    }

    #[tokio::test]
    async fn test_empty_numeric_elements_are_accepted() {
        let h = harness(GatewayConfig::default());
        let device = h.devices.register_or_recover(ID, DeviceBinding::new(source(), Network::Udp)).await;

        let body = format!("<Notify><CmdType>Keepalive</CmdType><SN></SN><DeviceID>{}</DeviceID></Notify>", ID);
        let resp = h.dispatcher.handle(&request("MESSAGE", ID, &body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(device.snapshot().await.last_keepalive.is_some());

        let body = format!(
            "<Response><CmdType>Catalog</CmdType><SN>5</SN><DeviceID>{}</DeviceID><SumNum>1</SumNum>\
             <DeviceList Num=\"1\"><Item><DeviceID>34020000001310000001</DeviceID><Name>cam</Name>\
             <Parental></Parental><Status>ON</Status><Longitude></Longitude><Latitude></Latitude></Item></DeviceList></Response>",
            ID
        );
        let resp = h.dispatcher.handle(&request("MESSAGE", ID, &body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(device.channel_count().await, 1);
        assert_eq!(device.channel("34020000001310000001").await.unwrap().name, "cam");
    }

    #[tokio::test]
    async fn test_recover_rebinds_and_resyncs() {
        let mut h = harness(GatewayConfig::default());
        let device = h.devices.register_or_recover(ID, DeviceBinding::new(source(), Network::Udp)).await;
        device.set_status(DeviceStatus::Recover).await;

        let new_source: SocketAddr = "192.168.1.65:5062".parse().unwrap();
        let body = format!("<Notify><CmdType>Keepalive</CmdType><SN>1</SN><DeviceID>{}</DeviceID></Notify>", ID);
        let resp = h
            .dispatcher
            .handle(&request("MESSAGE", ID, &body), new_source, Network::Tcp)
            .await
            .unwrap();

        assert_eq!(resp.status_code, 200);
        let state = device.snapshot().await;
        assert_eq!(state.status, DeviceStatus::Registering);
        assert_eq!(state.binding, DeviceBinding::new(new_source, Network::Tcp));
        expect_call(&mut h.calls, &format!("catalog:{}", ID)).await;
    }

    #[tokio::test]
    async fn test_unrecognized_and_undecodable_bodies_get_400() {
        let h = harness(GatewayConfig::default());
        h.devices.register_or_recover(ID, DeviceBinding::new(source(), Network::Udp)).await;

        let body = format!("<Control><CmdType>DeviceControl</CmdType><SN>1</SN><DeviceID>{}</DeviceID></Control>", ID);
        let resp = h.dispatcher.handle(&request("MESSAGE", ID, &body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 400);

        let resp = h.dispatcher.handle(&request("MESSAGE", ID, "not xml"), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 400);

        let resp = h.dispatcher.handle(&request("NOTIFY", ID, &body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn test_alarm_sets_status_and_acks() {
        let h = harness(GatewayConfig::default());
        let device = h.devices.register_or_recover(ID, DeviceBinding::new(source(), Network::Udp)).await;

        let body = format!(
            "<Notify><CmdType>Alarm</CmdType><SN>17</SN><DeviceID>{}</DeviceID><AlarmPriority>1</AlarmPriority><AlarmMethod>5</AlarmMethod></Notify>",
            ID
        );
        let resp = h.dispatcher.handle(&request("MESSAGE", ID, &body), source(), Network::Udp).await.unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(device.status().await, DeviceStatus::Alarmed);
        let text = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(text.contains("<CmdType>Alarm</CmdType>"));
        assert!(text.contains("<SN>17</SN>"));
        assert!(text.contains("<Result>OK</Result>"));
    }

    #[tokio::test]
    async fn test_device_info_and_position_notify() {
        let h = harness(GatewayConfig::default());
        let device = h.devices.register_or_recover(ID, DeviceBinding::new(source(), Network::Udp)).await;
        device.with_channels(|m| { m.entry("34020000001310000001", ID); }).await;

        let body = format!(
            "<Response><CmdType>DeviceInfo</CmdType><SN>2</SN><DeviceID>{}</DeviceID><DeviceName>NVR</DeviceName><Manufacturer>Hikvision</Manufacturer><Model>DS-7608</Model></Response>",
            ID
        );
        let resp = h.dispatcher.handle(&request("MESSAGE", ID, &body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 200);
        let state = device.snapshot().await;
        assert_eq!(state.name, "NVR");
        assert_eq!(state.manufacturer, "Hikvision");

        let body = "<Notify><CmdType>MobilePosition</CmdType><SN>3</SN><DeviceID>34020000001310000001</DeviceID><Time>2024-05-01T12:00:00</Time><Longitude>121.47</Longitude><Latitude>31.23</Latitude></Notify>";
        let resp = h.dispatcher.handle(&request("NOTIFY", ID, body), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 200);
        let channel = device.channel("34020000001310000001").await.unwrap();
        assert_eq!(channel.position.unwrap().latitude, 31.23);
    }

    #[tokio::test]
    async fn test_bye_and_other_methods() {
        let h = harness(GatewayConfig::default());
        let resp = h.dispatcher.handle(&request("BYE", ID, ""), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 200);

        let resp = h.dispatcher.handle(&request("INFO", ID, ""), source(), Network::Udp).await.unwrap();
        assert_eq!(resp.status_code, 405);

        assert!(h.dispatcher.handle(&request("ACK", ID, ""), source(), Network::Udp).await.is_none());
        assert!(h.querier.calls().is_empty());
    }
}
