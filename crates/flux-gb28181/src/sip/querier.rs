// 平台下发请求
// 以 MESSAGE/SUBSCRIBE 携带 MANSCDP 报文发往设备，不等待设备应答

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::manscdp::{self, CONTENT_TYPE};
use super::message::{SipMethod, SipRequest};
use super::transport::SipTransport;
use crate::auth::random_digits;
use crate::config::SipConfig;
use crate::error::Result;
use crate::sync::{DeviceQuerier, DeviceTarget};

const USER_AGENT: &str = "flux-gb28181";

pub struct SipQuerier {
    transport: Arc<SipTransport>,
    config: SipConfig,
    sn: AtomicU32,
}

impl SipQuerier {
    pub fn new(transport: Arc<SipTransport>, config: SipConfig) -> Self {
        Self {
            transport,
            config,
            sn: AtomicU32::new(1),
        }
    }

    fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    /// 构造发往设备的请求，头部与设备主动发起的请求格式一致
    pub fn build_request(&self, method: SipMethod, target: &DeviceTarget, sn: u32) -> SipRequest {
        let local_port = self.transport.local_addr().port();
        let mut req = SipRequest::new(method, format!("sip:{}@{}", target.device_id, target.addr));

        req.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};rport;branch=z9hG4bK{}",
                target.transport,
                self.config.public_ip,
                local_port,
                random_digits(9)
            ),
        );
        req.add_header(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.sip_id,
                self.config.domain,
                random_digits(9)
            ),
        );
        req.add_header("To", format!("<sip:{}@{}>", target.device_id, target.addr));
        req.add_header("Call-ID", random_digits(10));
        req.add_header("CSeq", format!("{} {}", sn, method));
        req.add_header(
            "Contact",
            format!("<sip:{}@{}:{}>", self.config.sip_id, self.config.public_ip, local_port),
        );
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", USER_AGENT);
        req
    }

    async fn send(&self, req: SipRequest, target: &DeviceTarget) -> Result<()> {
        self.transport
            .send(req.to_bytes(), target.addr, target.transport)
            .await?;
        tracing::debug!(
            target: "gb28181::sip",
            device_id = %target.device_id,
            method = %req.method,
            "Sent request to device"
        );
        Ok(())
    }
}

#[async_trait]
impl DeviceQuerier for SipQuerier {
    async fn query_catalog(&self, target: &DeviceTarget) -> Result<()> {
        let sn = self.next_sn();
        let mut req = self.build_request(SipMethod::Message, target, sn);
        req.set_body(CONTENT_TYPE, manscdp::catalog_query(sn, &target.device_id));
        self.send(req, target).await
    }

    async fn subscribe_catalog(&self, target: &DeviceTarget) -> Result<()> {
        let sn = self.next_sn();
        let mut req = self.build_request(SipMethod::Subscribe, target, sn);
        req.add_header("Expires", "3600");
        req.add_header("Event", format!("Catalog;id={}", sn));
        req.set_body(CONTENT_TYPE, manscdp::catalog_query(sn, &target.device_id));
        self.send(req, target).await
    }

    async fn query_device_info(&self, target: &DeviceTarget) -> Result<()> {
        let sn = self.next_sn();
        let mut req = self.build_request(SipMethod::Message, target, sn);
        req.set_body(CONTENT_TYPE, manscdp::device_info_query(sn, &target.device_id));
        self.send(req, target).await
    }

    async fn subscribe_mobile_position(
        &self,
        target: &DeviceTarget,
        expires: Duration,
        interval: Duration,
    ) -> Result<()> {
        let sn = self.next_sn();
        let mut req = self.build_request(SipMethod::Subscribe, target, sn);
        req.add_header("Expires", expires.as_secs().to_string());
        req.add_header("Event", "presence");
        req.set_body(
            CONTENT_TYPE,
            manscdp::mobile_position_query(sn, &target.device_id, interval.as_secs()),
        );
        self.send(req, target).await
    }
}
