//! Built-in protocol descriptor table for Hexframe
//!
//! Every protocol Hexframe decodes is declared here as a static
//! [`ProtocolDescriptor`]: a length rule, optional sub-header and
//! fragmentation rules, and an ordered list of bindings to candidate next
//! protocols. The scanner consumes these tables generically; there is no
//! per-protocol decode code outside this module.

use crate::buffer::ByteView;
use crate::core::packet::HeaderInstance;
use crate::protocols::{
    ids, Binding, BindingGuard, BindingKind, HeaderLength, ProtocolDescriptor, SubHeader,
};

const ETHERTYPE_IP4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IP6: u16 = 0x86DD;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_IP4: u8 = 4;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_GRE: u8 = 47;

const IP4_FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const IP4_FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

const L2TP_PORT: u16 = 1701;

/// Build the full built-in descriptor table, in no particular order
pub fn builtin_descriptors() -> Vec<ProtocolDescriptor> {
    vec![
        payload(),
        ethernet(),
        vlan(),
        null_header(),
        arp(),
        ip4(),
        ip6(),
        tcp(),
        udp(),
        icmp(),
        gre(),
        l2tp(),
        ip4_options(),
        tcp_options(),
        http(),
    ]
}

fn always(_: &ByteView, _: &HeaderInstance) -> bool {
    true
}

fn primary(target: u32, guard: BindingGuard) -> Binding {
    Binding {
        target,
        kind: BindingKind::Primary,
        guard: Some(guard),
        requires: &[],
        predicate: always,
    }
}

// ---------------------------------------------------------------------------
// Link layer
// ---------------------------------------------------------------------------

fn ethernet() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::ETHERNET,
        name: "ethernet",
        length: HeaderLength::Fixed(14),
        sub_headers: None,
        fragmentation: None,
        bindings: vec![
            primary(ids::IP4, BindingGuard::U16At { offset: 12, value: ETHERTYPE_IP4 }),
            primary(ids::IP6, BindingGuard::U16At { offset: 12, value: ETHERTYPE_IP6 }),
            primary(ids::VLAN, BindingGuard::U16At { offset: 12, value: ETHERTYPE_VLAN }),
            primary(ids::ARP, BindingGuard::U16At { offset: 12, value: ETHERTYPE_ARP }),
        ],
    }
}

fn vlan() -> ProtocolDescriptor {
    // 802.1Q tag: TCI followed by the encapsulated ethertype
    ProtocolDescriptor {
        id: ids::VLAN,
        name: "vlan",
        length: HeaderLength::Fixed(4),
        sub_headers: None,
        fragmentation: None,
        bindings: vec![
            primary(ids::IP4, BindingGuard::U16At { offset: 2, value: ETHERTYPE_IP4 }),
            primary(ids::IP6, BindingGuard::U16At { offset: 2, value: ETHERTYPE_IP6 }),
            primary(ids::VLAN, BindingGuard::U16At { offset: 2, value: ETHERTYPE_VLAN }),
            primary(ids::ARP, BindingGuard::U16At { offset: 2, value: ETHERTYPE_ARP }),
        ],
    }
}

/// The loopback family field is written in the capturing host's byte order,
/// so the same family value can arrive with either byte layout.
fn null_family_is(view: &ByteView, parent: &HeaderInstance, family: u8) -> bool {
    match view.get_bytes(parent.offset, 4) {
        Ok(bytes) => {
            bytes == [0, 0, 0, family] || bytes == [family, 0, 0, 0]
        }
        Err(_) => false,
    }
}

fn null_binds_ip4(view: &ByteView, parent: &HeaderInstance) -> bool {
    null_family_is(view, parent, 2) // AF_INET
}

fn null_binds_ip6(view: &ByteView, parent: &HeaderInstance) -> bool {
    // AF_INET6 differs per capturing platform
    [10u8, 24, 28, 30]
        .iter()
        .any(|&family| null_family_is(view, parent, family))
}

fn null_header() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::NULL_HEADER,
        name: "null",
        length: HeaderLength::Fixed(4),
        sub_headers: None,
        fragmentation: None,
        bindings: vec![
            Binding {
                target: ids::IP4,
                kind: BindingKind::Primary,
                guard: None,
                requires: &[],
                predicate: null_binds_ip4,
            },
            Binding {
                target: ids::IP6,
                kind: BindingKind::Primary,
                guard: None,
                requires: &[],
                predicate: null_binds_ip6,
            },
        ],
    }
}

fn arp() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::ARP,
        name: "arp",
        length: HeaderLength::Fixed(28),
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Network layer
// ---------------------------------------------------------------------------

fn ip4_header_length(view: &ByteView, offset: usize) -> Option<usize> {
    let ihl: usize = (view.get_u8(offset).ok()? & 0x0F) as usize;
    if ihl < 5 {
        return None; // malformed IHL, treat as undecodable
    }
    Some(ihl * 4)
}

fn ip4_sub_headers(_view: &ByteView, parent: &HeaderInstance) -> Vec<SubHeader> {
    // Options occupy the space between the fixed 20-byte header and IHL * 4
    if parent.length > 20 {
        vec![SubHeader {
            protocol: ids::IP4_OPTIONS,
            offset: parent.offset + 20,
            length: parent.length - 20,
        }]
    } else {
        Vec::new()
    }
}

fn ip4_is_fragment(view: &ByteView, parent: &HeaderInstance) -> bool {
    match view.get_u16(parent.offset + 6) {
        Ok(flags) => {
            (flags & IP4_FLAG_MORE_FRAGMENTS) != 0 || (flags & IP4_FRAGMENT_OFFSET_MASK) != 0
        }
        Err(_) => false,
    }
}

/// The bytes after a non-first fragment are mid-datagram payload, not a
/// transport header, so transport bindings only apply at fragment offset 0.
fn ip4_payload_starts_with_transport(view: &ByteView, parent: &HeaderInstance) -> bool {
    match view.get_u16(parent.offset + 6) {
        Ok(flags) => (flags & IP4_FRAGMENT_OFFSET_MASK) == 0,
        Err(_) => false,
    }
}

fn ip4_transport_binding(target: u32, proto: u8) -> Binding {
    Binding {
        target,
        kind: BindingKind::Primary,
        guard: Some(BindingGuard::U8At { offset: 9, value: proto }),
        requires: &[],
        predicate: ip4_payload_starts_with_transport,
    }
}

fn ip4() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::IP4,
        name: "ip4",
        length: HeaderLength::Dynamic {
            min: 20,
            rule: ip4_header_length,
        },
        sub_headers: Some(ip4_sub_headers),
        fragmentation: Some(ip4_is_fragment),
        bindings: vec![
            ip4_transport_binding(ids::TCP, IP_PROTO_TCP),
            ip4_transport_binding(ids::UDP, IP_PROTO_UDP),
            ip4_transport_binding(ids::ICMP, IP_PROTO_ICMP),
            ip4_transport_binding(ids::GRE, IP_PROTO_GRE),
            ip4_transport_binding(ids::IP4, IP_PROTO_IP4),
        ],
    }
}

fn ip6() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::IP6,
        name: "ip6",
        length: HeaderLength::Fixed(40),
        sub_headers: None,
        fragmentation: None,
        bindings: vec![
            primary(ids::TCP, BindingGuard::U8At { offset: 6, value: IP_PROTO_TCP }),
            primary(ids::UDP, BindingGuard::U8At { offset: 6, value: IP_PROTO_UDP }),
        ],
    }
}

fn ip4_options() -> ProtocolDescriptor {
    // Sub-header only; never scanned as a top-level chain element
    ProtocolDescriptor {
        id: ids::IP4_OPTIONS,
        name: "ip4.options",
        length: HeaderLength::Dynamic {
            min: 1,
            rule: |_, _| None,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Transport layer
// ---------------------------------------------------------------------------

fn tcp_header_length(view: &ByteView, offset: usize) -> Option<usize> {
    let data_offset: usize = (view.get_u8(offset + 12).ok()? >> 4) as usize;
    if data_offset < 5 {
        return None;
    }
    Some(data_offset * 4)
}

fn tcp_sub_headers(_view: &ByteView, parent: &HeaderInstance) -> Vec<SubHeader> {
    if parent.length > 20 {
        vec![SubHeader {
            protocol: ids::TCP_OPTIONS,
            offset: parent.offset + 20,
            length: parent.length - 20,
        }]
    } else {
        Vec::new()
    }
}

/// Best-guess check for an HTTP message at the start of the TCP payload
fn tcp_payload_looks_like_http(view: &ByteView, parent: &HeaderInstance) -> bool {
    const STARTS: [&[u8]; 8] = [
        b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"TRAC", b"HTTP",
    ];
    match view.get_bytes(parent.offset + parent.length, 4) {
        Ok(start) => STARTS.iter().any(|&s| start == s),
        Err(_) => false,
    }
}

fn tcp() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::TCP,
        name: "tcp",
        length: HeaderLength::Dynamic {
            min: 20,
            rule: tcp_header_length,
        },
        sub_headers: Some(tcp_sub_headers),
        fragmentation: None,
        bindings: vec![Binding {
            target: ids::HTTP,
            kind: BindingKind::Heuristic,
            guard: None,
            requires: &[],
            predicate: tcp_payload_looks_like_http,
        }],
    }
}

/// L2TPv2 over the well-known UDP port, with the version nibble checked
fn udp_binds_l2tp(view: &ByteView, parent: &HeaderInstance) -> bool {
    let src: u16 = match view.get_u16(parent.offset) {
        Ok(port) => port,
        Err(_) => return false,
    };
    let dst: u16 = match view.get_u16(parent.offset + 2) {
        Ok(port) => port,
        Err(_) => return false,
    };
    if src != L2TP_PORT && dst != L2TP_PORT {
        return false;
    }
    match view.get_u16(parent.offset + parent.length) {
        Ok(flags) => (flags & 0x000F) == 2,
        Err(_) => false,
    }
}

fn udp() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::UDP,
        name: "udp",
        length: HeaderLength::Fixed(8),
        sub_headers: None,
        fragmentation: None,
        bindings: vec![Binding {
            target: ids::L2TP,
            kind: BindingKind::Primary,
            guard: None,
            // The built-in L2TP decode assumes an IPv4 transport
            requires: &[ids::IP4],
            predicate: udp_binds_l2tp,
        }],
    }
}

fn icmp() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::ICMP,
        name: "icmp",
        length: HeaderLength::Fixed(8),
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

fn tcp_options() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::TCP_OPTIONS,
        name: "tcp.options",
        length: HeaderLength::Dynamic {
            min: 1,
            rule: |_, _| None,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tunneling
// ---------------------------------------------------------------------------

const GRE_FLAG_CHECKSUM: u16 = 0x8000;
const GRE_FLAG_KEY: u16 = 0x2000;
const GRE_FLAG_SEQUENCE: u16 = 0x1000;

fn gre_header_length(view: &ByteView, offset: usize) -> Option<usize> {
    let flags: u16 = view.get_u16(offset).ok()?;
    let mut length: usize = 4;
    if flags & GRE_FLAG_CHECKSUM != 0 {
        length += 4;
    }
    if flags & GRE_FLAG_KEY != 0 {
        length += 4;
    }
    if flags & GRE_FLAG_SEQUENCE != 0 {
        length += 4;
    }
    Some(length)
}

fn gre() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::GRE,
        name: "gre",
        length: HeaderLength::Dynamic {
            min: 4,
            rule: gre_header_length,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: vec![
            primary(ids::IP4, BindingGuard::U16At { offset: 2, value: ETHERTYPE_IP4 }),
            primary(ids::IP6, BindingGuard::U16At { offset: 2, value: ETHERTYPE_IP6 }),
        ],
    }
}

const L2TP_FLAG_LENGTH: u16 = 0x4000;
const L2TP_FLAG_SEQUENCE: u16 = 0x0800;
const L2TP_FLAG_OFFSET: u16 = 0x0200;

/// L2TPv2 header length depends on the flag bits at offset 0: the length,
/// sequence and offset fields are each only present when flagged, and the
/// offset-size field value extends the header by that many pad bytes.
fn l2tp_header_length(view: &ByteView, offset: usize) -> Option<usize> {
    let flags: u16 = view.get_u16(offset).ok()?;
    let mut length: usize = 6; // flags + tunnel id + session id
    if flags & L2TP_FLAG_LENGTH != 0 {
        length += 2;
    }
    if flags & L2TP_FLAG_SEQUENCE != 0 {
        length += 4; // Ns + Nr
    }
    if flags & L2TP_FLAG_OFFSET != 0 {
        let pad: usize = view.get_u16(offset + length).ok()? as usize;
        length += 2 + pad;
    }
    Some(length)
}

fn l2tp() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::L2TP,
        name: "l2tp",
        length: HeaderLength::Dynamic {
            min: 6,
            rule: l2tp_header_length,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Application layer
// ---------------------------------------------------------------------------

/// An HTTP header block runs to the blank line; without one, the whole
/// remainder is treated as the header portion seen so far.
fn http_header_length(view: &ByteView, offset: usize) -> Option<usize> {
    let bytes: &[u8] = view.get_bytes(offset, view.size() - offset).ok()?;
    match bytes.windows(4).position(|w: &[u8]| w == b"\r\n\r\n") {
        Some(index) => Some(index + 4),
        None => Some(bytes.len()),
    }
}

fn http() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::HTTP,
        name: "http",
        length: HeaderLength::Dynamic {
            min: 4,
            rule: http_header_length,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Catch-all
// ---------------------------------------------------------------------------

fn payload_length(view: &ByteView, offset: usize) -> Option<usize> {
    Some(view.size().saturating_sub(offset))
}

fn payload() -> ProtocolDescriptor {
    ProtocolDescriptor {
        id: ids::PAYLOAD,
        name: "payload",
        length: HeaderLength::Dynamic {
            min: 0,
            rule: payload_length,
        },
        sub_headers: None,
        fragmentation: None,
        bindings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;

    fn view(bytes: Vec<u8>) -> ByteView {
        ByteView::new(bytes).with_byte_order(ByteOrder::BigEndian)
    }

    #[test]
    fn test_ip4_header_length_from_ihl() {
        let v: ByteView = view(vec![0x45; 20]);
        assert_eq!(ip4_header_length(&v, 0), Some(20));
        let v: ByteView = view(vec![0x46; 24]);
        assert_eq!(ip4_header_length(&v, 0), Some(24));
        let v: ByteView = view(vec![0x42; 20]);
        assert_eq!(ip4_header_length(&v, 0), None);
    }

    #[test]
    fn test_l2tp_header_length_from_flags() {
        // No optional fields: version 2 only
        let v: ByteView = view(vec![0x00, 0x02, 0, 1, 0, 2]);
        assert_eq!(l2tp_header_length(&v, 0), Some(6));

        // Length + sequence fields present
        let v: ByteView = view(vec![0x48, 0x02, 0, 12, 0, 1, 0, 2, 0, 0, 0, 0]);
        assert_eq!(l2tp_header_length(&v, 0), Some(12));

        // Offset field present with 2 pad bytes
        let mut bytes: Vec<u8> = vec![0x02, 0x02, 0, 1, 0, 2, 0, 2, 0, 0];
        bytes.resize(10, 0);
        let v: ByteView = view(bytes);
        assert_eq!(l2tp_header_length(&v, 0), Some(10));

        // Flags themselves missing
        let v: ByteView = view(vec![0x48]);
        assert_eq!(l2tp_header_length(&v, 0), None);
    }

    #[test]
    fn test_gre_header_length_from_flags() {
        let v: ByteView = view(vec![0x00, 0x00, 0x08, 0x00]);
        assert_eq!(gre_header_length(&v, 0), Some(4));
        let v: ByteView = view(vec![0xB0, 0x00, 0x08, 0x00]);
        assert_eq!(gre_header_length(&v, 0), Some(16));
    }

    #[test]
    fn test_http_header_length() {
        let v: ByteView = view(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nBODY".to_vec());
        assert_eq!(http_header_length(&v, 0), Some(27));
        let v: ByteView = view(b"GET / HTTP/1.1\r\nHost".to_vec());
        assert_eq!(http_header_length(&v, 0), Some(20));
    }

    #[test]
    fn test_ip4_fragmentation_rule() {
        let mut bytes: Vec<u8> = vec![0x45, 0, 0, 40, 0, 1, 0x20, 0x00, 64, 6];
        bytes.resize(20, 0);
        let parent: HeaderInstance = HeaderInstance::top_level(ids::IP4, 0, 20);
        assert!(ip4_is_fragment(&view(bytes.clone()), &parent));

        bytes[6] = 0x00;
        bytes[7] = 0x10; // offset 16 * 8, last fragment
        assert!(ip4_is_fragment(&view(bytes.clone()), &parent));
        assert!(!ip4_payload_starts_with_transport(&view(bytes.clone()), &parent));

        bytes[7] = 0x00;
        assert!(!ip4_is_fragment(&view(bytes.clone()), &parent));
        assert!(ip4_payload_starts_with_transport(&view(bytes), &parent));
    }

    #[test]
    fn test_null_header_family_either_byte_order() {
        let parent: HeaderInstance = HeaderInstance::top_level(ids::NULL_HEADER, 0, 4);
        assert!(null_binds_ip4(&view(vec![0, 0, 0, 2]), &parent));
        assert!(null_binds_ip4(&view(vec![2, 0, 0, 0]), &parent));
        assert!(!null_binds_ip4(&view(vec![0, 0, 0, 10]), &parent));
        assert!(null_binds_ip6(&view(vec![0, 0, 0, 10]), &parent));
    }
}
