//! Per-session control point.
//!
//! Sits between a transport and the [`RequestHandler`]: decodes frames,
//! encodes responses, and counts successful data writes for packet receipt
//! notifications (PRN). A successful Write gets no response of its own; every
//! `prn` writes the host instead receives an unsolicited CRC response once the
//! writes have reached flash.

use tracing::{debug, trace};

use super::config::{ObjectType, OpCode};
use super::flash::FlashDriver;
use super::handler::RequestHandler;
use super::request::{Request, Response};
use crate::traits::SignatureVerifier;

#[derive(Debug, Default)]
pub struct ControlPoint {
    /// Writes between notifications. 0 disables them.
    prn: u16,
    writes_since_notification: u16,
    notification_due: bool,
}

impl ControlPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prn(&self) -> u16 {
        self.prn
    }

    /// Handle one inbound frame. Returns the response frame to send, if any.
    pub fn on_frame<F: FlashDriver, V: SignatureVerifier>(
        &mut self,
        handler: &mut RequestHandler<F, V>,
        frame: &[u8],
    ) -> Option<Vec<u8>> {
        let request = match Request::parse(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(opcode = e.opcode, code = ?e.code, "malformed request");
                return Some(e.response().encode());
            }
        };

        if let Request::SetReceiptNotification { prn } = request {
            debug!(prn, "receipt notification interval set");
            self.prn = prn;
            self.writes_since_notification = 0;
        }
        let creates_data = matches!(
            request,
            Request::Create { object_type, .. } if object_type == ObjectType::Data as u8
        );

        let response = handler.handle(request);

        match OpCode::from_byte(response.opcode) {
            Some(OpCode::Write) if response.is_success() => {
                self.count_write();
                None
            }
            Some(OpCode::Create) if response.is_success() && creates_data => {
                self.writes_since_notification = 0;
                self.notification_due = false;
                Some(response.encode())
            }
            _ => Some(response.encode()),
        }
    }

    fn count_write(&mut self) {
        if self.prn == 0 {
            return;
        }
        self.writes_since_notification += 1;
        if self.writes_since_notification >= self.prn {
            self.writes_since_notification = 0;
            self.notification_due = true;
        }
    }

    /// Let queued flash work finish and emit a receipt notification if one
    /// is due.
    pub fn drive<F: FlashDriver, V: SignatureVerifier>(
        &mut self,
        handler: &mut RequestHandler<F, V>,
    ) -> Option<Vec<u8>> {
        let processed = handler.run_flash();
        if processed > 0 {
            trace!(processed, "flash operations completed");
        }
        if !self.notification_due || handler.is_flash_busy() {
            return None;
        }
        self.notification_due = false;
        let payload = handler.calculate_crc();
        Some(Response::success(OpCode::CalculateCrc, payload).encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::checksum::crc32;
    use crate::test_helpers::fixtures::{image_bytes, HandlerFixture, InitCommandBuilder};

    const DATA: u8 = ObjectType::Data as u8;

    fn setup(image: &[u8]) -> HandlerFixture {
        let init = InitCommandBuilder::application(image.len() as u32)
            .image(image)
            .build();
        let mut fx = HandlerFixture::new();
        assert!(fx.send_init(&init).is_success());
        fx
    }

    #[test]
    fn test_malformed_frame_gets_error_response() {
        let mut fx = HandlerFixture::new();
        let mut cp = ControlPoint::new();
        assert_eq!(cp.on_frame(&mut fx.handler, &[0x05]), Some(vec![0x60, 0x05, 0x02]));
        assert_eq!(cp.on_frame(&mut fx.handler, &[0x06]), Some(vec![0x60, 0x06, 0x03]));
    }

    #[test]
    fn test_successful_write_is_silent() {
        let image = image_bytes(4096);
        let mut fx = setup(&image);
        let mut cp = ControlPoint::new();

        cp.on_frame(&mut fx.handler, &Request::Select { object_type: DATA }.encode());
        cp.on_frame(&mut fx.handler, &Request::Create { object_type: DATA, size: 4096 }.encode());
        cp.drive(&mut fx.handler);

        let write = Request::Write { data: image[..64].to_vec() }.encode();
        assert_eq!(cp.on_frame(&mut fx.handler, &write), None);
        // PRN is off, so nothing arrives later either.
        assert_eq!(cp.drive(&mut fx.handler), None);
    }

    #[test]
    fn test_failed_write_is_answered() {
        let mut fx = HandlerFixture::new();
        let mut cp = ControlPoint::new();
        let write = Request::Write { data: vec![1, 2, 3] }.encode();
        assert_eq!(cp.on_frame(&mut fx.handler, &write), Some(vec![0x60, 0x08, 0x08]));
    }

    #[test]
    fn test_receipt_notification_after_prn_writes() {
        let image = image_bytes(4096);
        let mut fx = setup(&image);
        let mut cp = ControlPoint::new();

        let set = Request::SetReceiptNotification { prn: 2 }.encode();
        assert_eq!(cp.on_frame(&mut fx.handler, &set), Some(vec![0x60, 0x02, 0x01]));
        assert_eq!(cp.prn(), 2);

        cp.on_frame(&mut fx.handler, &Request::Select { object_type: DATA }.encode());
        cp.on_frame(&mut fx.handler, &Request::Create { object_type: DATA, size: 4096 }.encode());
        cp.drive(&mut fx.handler);

        let write = |range: std::ops::Range<usize>| Request::Write { data: image[range].to_vec() }.encode();

        assert_eq!(cp.on_frame(&mut fx.handler, &write(0..100)), None);
        assert_eq!(cp.drive(&mut fx.handler), None);
        assert_eq!(cp.on_frame(&mut fx.handler, &write(100..200)), None);

        let mut expected = vec![0x60, 0x03, 0x01];
        expected.extend_from_slice(&200u32.to_le_bytes());
        expected.extend_from_slice(&crc32(&image[..200]).to_le_bytes());
        assert_eq!(cp.drive(&mut fx.handler), Some(expected));
        assert_eq!(cp.drive(&mut fx.handler), None);
    }

    #[test]
    fn test_create_rearms_receipt_counter() {
        let image = image_bytes(4096);
        let mut fx = setup(&image);
        let mut cp = ControlPoint::new();

        cp.on_frame(&mut fx.handler, &Request::SetReceiptNotification { prn: 2 }.encode());
        cp.on_frame(&mut fx.handler, &Request::Select { object_type: DATA }.encode());
        let create = Request::Create { object_type: DATA, size: 4096 }.encode();
        cp.on_frame(&mut fx.handler, &create);
        cp.drive(&mut fx.handler);

        cp.on_frame(&mut fx.handler, &Request::Write { data: image[..10].to_vec() }.encode());
        cp.drive(&mut fx.handler);

        // Restarting the object resets the count.
        cp.on_frame(&mut fx.handler, &create);
        cp.drive(&mut fx.handler);
        cp.on_frame(&mut fx.handler, &Request::Write { data: image[..10].to_vec() }.encode());
        assert_eq!(cp.drive(&mut fx.handler), None);
    }
}
