//! Stateless framing codec.
//!
//! Wire frame: `FF FF | u16_be length | payload`. A payload is a control
//! message iff its first six bytes are zero and it is at least twelve
//! bytes long; after the sentinel come four action bytes, two operator
//! bytes and a UTF-8 JSON body. Real Ethernet frames never begin with six
//! zero bytes (an all-zero destination MAC is not a valid station
//! address), so the sentinel cannot collide with data in practice; a
//! frame that does collide is treated as control.

use crate::error::ProtoError;

/// Leading bytes of every wire frame.
pub const MAGIC: [u8; 2] = [0xff, 0xff];

/// Fixed header size: magic plus big-endian u16 payload length.
pub const HEADER_SIZE: usize = 4;

/// Number of zero bytes that mark a control payload.
pub const SENTINEL_SIZE: usize = 6;

/// Smallest payload that can carry a control message (sentinel, action,
/// operator, empty body).
pub const CONTROL_MIN: usize = 12;

/// Default payload bounds, in bytes.
pub const MIN_PAYLOAD: usize = 15;
pub const MAX_PAYLOAD: usize = 1514;

/// Encode the 4-byte wire header for a payload of `len` bytes.
pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
    let size = len as u16;
    [MAGIC[0], MAGIC[1], (size >> 8) as u8, size as u8]
}

/// Decode a wire header, returning the declared payload length.
///
/// Fails with `BadMagic` when the frame does not start with `FF FF` and
/// with `BadSize` when the declared length falls outside `[min, max]`.
/// No payload bytes are consumed either way.
pub fn decode_header(header: &[u8; HEADER_SIZE], min: usize, max: usize) -> Result<usize, ProtoError> {
    if header[..2] != MAGIC {
        return Err(ProtoError::BadMagic {
            found: [header[0], header[1]],
        });
    }
    let size = u16::from_be_bytes([header[2], header[3]]) as usize;
    if size < min || size > max {
        return Err(ProtoError::BadSize(size));
    }
    Ok(size)
}

/// Prepend the wire header to a payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&encode_header(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

/// Whether a payload carries a control message.
pub fn is_control(payload: &[u8]) -> bool {
    payload.len() >= CONTROL_MIN && payload[..SENTINEL_SIZE].iter().all(|&b| b == 0)
}

/// Control actions understood by the switch.
///
/// Four bytes go on the wire; the long names exist for configuration and
/// logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Login,
    IpAddr,
    Left,
    Neighbor,
    Logout,
    Stats,
    Ping,
}

impl Action {
    pub fn wire(&self) -> &'static [u8; 4] {
        match self {
            Action::Login => b"logi",
            Action::IpAddr => b"ipad",
            Action::Left => b"left",
            Action::Neighbor => b"neig",
            Action::Logout => b"logo",
            Action::Stats => b"stat",
            Action::Ping => b"ping",
        }
    }

    pub fn from_wire(bytes: &[u8; 4]) -> Option<Self> {
        match bytes {
            b"logi" => Some(Action::Login),
            b"ipad" => Some(Action::IpAddr),
            b"left" => Some(Action::Left),
            b"neig" => Some(Action::Neighbor),
            b"logo" => Some(Action::Logout),
            b"stat" => Some(Action::Stats),
            b"ping" => Some(Action::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::IpAddr => "ipaddr",
            Action::Left => "left",
            Action::Neighbor => "neighbor",
            Action::Logout => "logout",
            Action::Stats => "stats",
            Action::Ping => "ping",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response marker following the action bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Request,
    Response,
}

impl Operator {
    pub fn wire(&self) -> &'static [u8; 2] {
        match self {
            Operator::Request => b"= ",
            Operator::Response => b": ",
        }
    }

    pub fn from_wire(bytes: &[u8; 2]) -> Option<Self> {
        match bytes {
            b"= " => Some(Operator::Request),
            b": " => Some(Operator::Response),
            _ => None,
        }
    }
}

/// A decoded control payload, borrowing from the frame it came from.
///
/// `action` and `operator` stay raw here; unknown values must travel up
/// to the request plane so it can answer with a protocol error instead
/// of dropping the message on the floor.
#[derive(Debug, Clone, Copy)]
pub struct RawControl<'a> {
    pub action: &'a [u8; 4],
    pub operator: &'a [u8; 2],
    pub body: &'a [u8],
}

impl<'a> RawControl<'a> {
    pub fn action(&self) -> Option<Action> {
        Action::from_wire(self.action)
    }

    pub fn operator(&self) -> Option<Operator> {
        Operator::from_wire(self.operator)
    }

    /// Wire action bytes as text, for logging unknown actions.
    pub fn action_lossy(&self) -> String {
        String::from_utf8_lossy(self.action).into_owned()
    }
}

/// Encode a control payload: sentinel, action, operator, body.
pub fn encode_control(action: Action, operator: Operator, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CONTROL_MIN + body.len());
    buf.extend_from_slice(&[0u8; SENTINEL_SIZE]);
    buf.extend_from_slice(action.wire());
    buf.extend_from_slice(operator.wire());
    buf.extend_from_slice(body);
    buf
}

/// One decoded message: either a control payload or an Ethernet frame.
#[derive(Debug, Clone)]
pub struct FrameMessage {
    data: Vec<u8>,
}

impl FrameMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_control(&self) -> bool {
        is_control(&self.data)
    }

    /// Decode the control layout, or `None` for data frames.
    pub fn control(&self) -> Option<RawControl<'_>> {
        if !self.is_control() {
            return None;
        }
        let action: &[u8; 4] = self.data[SENTINEL_SIZE..SENTINEL_SIZE + 4]
            .try_into()
            .ok()?;
        let operator: &[u8; 2] = self.data[SENTINEL_SIZE + 4..CONTROL_MIN].try_into().ok()?;
        Some(RawControl {
            action,
            operator,
            body: &self.data[CONTROL_MIN..],
        })
    }

    /// The raw payload bytes (the Ethernet frame, for data messages).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for len in [0usize, 1, 15, 600, 1514] {
            let header = encode_header(len);
            assert_eq!(header[..2], MAGIC);
            assert_eq!(decode_header(&header, 0, 1514).unwrap(), len);
        }
    }

    #[test]
    fn test_header_bad_magic() {
        let header = [0xfe, 0xff, 0x00, 0x05];
        match decode_header(&header, 0, 1514) {
            Err(ProtoError::BadMagic { found }) => assert_eq!(found, [0xfe, 0xff]),
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_header_size_bounds() {
        // min-1 and max+1 both rejected, bounds themselves accepted.
        assert!(matches!(
            decode_header(&encode_header(14), 15, 1514),
            Err(ProtoError::BadSize(14))
        ));
        assert!(matches!(
            decode_header(&encode_header(1515), 15, 1514),
            Err(ProtoError::BadSize(1515))
        ));
        assert_eq!(decode_header(&encode_header(15), 15, 1514).unwrap(), 15);
        assert_eq!(decode_header(&encode_header(1514), 15, 1514).unwrap(), 1514);
    }

    #[test]
    fn test_frame_prepends_header() {
        let framed = frame(b"hello");
        assert_eq!(&framed[..4], &[0xff, 0xff, 0x00, 0x05]);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_control_classification() {
        // Zero sentinel but shorter than a full control layout: data.
        assert!(!is_control(&[0u8; 11]));
        // Exactly the minimum control size.
        assert!(is_control(&[0u8; 12]));
        // Ethernet broadcast frame: not control.
        let mut eth = vec![0xffu8; 60];
        assert!(!is_control(&eth));
        // First six bytes zero with trailing content: control by the
        // sentinel rule even if it came from a data path.
        eth[..6].fill(0);
        assert!(is_control(&eth));
    }

    #[test]
    fn test_control_roundtrip() {
        let payload = encode_control(Action::Login, Operator::Request, b"{\"username\":\"u\"}");
        let msg = FrameMessage::new(payload);
        assert!(msg.is_control());
        let ctl = msg.control().unwrap();
        assert_eq!(ctl.action(), Some(Action::Login));
        assert_eq!(ctl.operator(), Some(Operator::Request));
        assert_eq!(ctl.body, b"{\"username\":\"u\"}");
    }

    #[test]
    fn test_unknown_action_surfaces_raw() {
        let mut payload = encode_control(Action::Ping, Operator::Request, b"{}");
        payload[6..10].copy_from_slice(b"nope");
        let msg = FrameMessage::new(payload);
        let ctl = msg.control().unwrap();
        assert_eq!(ctl.action(), None);
        assert_eq!(ctl.action_lossy(), "nope");
    }

    #[test]
    fn test_action_wire_width() {
        for action in [
            Action::Login,
            Action::IpAddr,
            Action::Left,
            Action::Neighbor,
            Action::Logout,
            Action::Stats,
            Action::Ping,
        ] {
            assert_eq!(Action::from_wire(action.wire()), Some(action));
        }
    }

    #[test]
    fn test_data_frame_passthrough() {
        let frame_bytes = vec![0xaa; 64];
        let msg = FrameMessage::new(frame_bytes.clone());
        assert!(!msg.is_control());
        assert!(msg.control().is_none());
        assert_eq!(msg.data(), &frame_bytes[..]);
    }
}
