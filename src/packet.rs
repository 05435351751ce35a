//! IP packet decoding and building
//!
//! Decoding never allocates and never panics on short input: every field
//! read is bounds-checked first and the result only records offsets into
//! the caller's buffer.

use crate::error::DecodeError;
use smoltcp::wire::IpProtocol;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_MSS_V4: u16 = 1360;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    /// Flags from the TCP flags byte
    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// Header summary of one IP packet. Offsets index the decoded buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub version: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: IpProtocol,
    /// IP header length (IHL * 4, or 40 for IPv6)
    pub header_len: usize,
    /// Start of the application payload
    pub payload_offset: usize,
    /// Length declared by the IP header; trailing bytes are ignored
    pub total_len: usize,
    pub ttl: u8,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
    Unsupported(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub data_offset: u8,
    pub mss: Option<u16>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
}

impl DecodedPacket {
    /// Source address with port, TCP/UDP only
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.src, t.src_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.src, u.src_port)),
            _ => None,
        }
    }

    /// Destination address with port, TCP/UDP only
    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.dst, t.dst_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.dst, u.dst_port)),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, Transport::Tcp(t) if t.flags.syn && !t.flags.ack)
    }

    /// Application payload slice of `data`, the buffer this was decoded from
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let len = match &self.transport {
            Transport::Tcp(t) => t.payload_len,
            Transport::Udp(u) => u.payload_len,
            _ => self.total_len.saturating_sub(self.payload_offset),
        };
        data.get(self.payload_offset..self.payload_offset + len).unwrap_or(&[])
    }
}

#[inline]
fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

#[inline]
fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn need(len: usize, needed: usize) -> Result<(), DecodeError> {
    if len < needed {
        Err(DecodeError::Truncated { needed, actual: len })
    } else {
        Ok(())
    }
}

/// Decode the IP and transport headers of a raw packet
pub fn decode(data: &[u8]) -> Result<DecodedPacket, DecodeError> {
    need(data.len(), 1)?;
    match data[0] >> 4 {
        4 => decode_ipv4(data),
        6 => decode_ipv6(data),
        v => Err(DecodeError::UnsupportedVersion(v)),
    }
}

fn decode_ipv4(data: &[u8]) -> Result<DecodedPacket, DecodeError> {
    need(data.len(), IPV4_HEADER_LEN)?;

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN {
        return Err(DecodeError::Malformed("IPv4 IHL below 5"));
    }
    need(data.len(), ihl)?;

    let total_len = be16(data, 2) as usize;
    if total_len < ihl {
        return Err(DecodeError::Malformed("IPv4 total length smaller than header"));
    }
    need(data.len(), total_len)?;

    let packet = &data[..total_len];
    let proto = packet[9];
    let fragment_offset = be16(packet, 6) & 0x1FFF;

    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));

    // Only the first fragment carries the transport header
    let transport = if fragment_offset != 0 {
        Transport::Unsupported(proto)
    } else {
        decode_transport(proto, packet, ihl, false)?
    };

    Ok(DecodedPacket {
        version: 4,
        src,
        dst,
        protocol: IpProtocol::from(proto),
        header_len: ihl,
        payload_offset: transport_payload_offset(&transport, ihl),
        total_len,
        ttl: packet[8],
        transport,
    })
}

fn decode_ipv6(data: &[u8]) -> Result<DecodedPacket, DecodeError> {
    need(data.len(), IPV6_HEADER_LEN)?;

    let total_len = IPV6_HEADER_LEN + be16(data, 4) as usize;
    need(data.len(), total_len)?;

    let packet = &data[..total_len];
    let next_header = packet[6];

    let mut src = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);

    let transport = decode_transport(next_header, packet, IPV6_HEADER_LEN, true)?;

    Ok(DecodedPacket {
        version: 6,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: IpProtocol::from(next_header),
        header_len: IPV6_HEADER_LEN,
        payload_offset: transport_payload_offset(&transport, IPV6_HEADER_LEN),
        total_len,
        ttl: packet[7],
        transport,
    })
}

fn transport_payload_offset(transport: &Transport, ip_header_len: usize) -> usize {
    match transport {
        Transport::Tcp(t) => t.payload_offset,
        Transport::Udp(u) => u.payload_offset,
        _ => ip_header_len,
    }
}

fn decode_transport(
    proto: u8,
    packet: &[u8],
    offset: usize,
    v6: bool,
) -> Result<Transport, DecodeError> {
    match proto {
        6 => decode_tcp(packet, offset),
        17 => decode_udp(packet, offset),
        1 if !v6 => decode_icmp(packet, offset),
        58 if v6 => decode_icmp(packet, offset),
        other => Ok(Transport::Unsupported(other)),
    }
}

fn decode_tcp(packet: &[u8], offset: usize) -> Result<Transport, DecodeError> {
    need(packet.len(), offset + TCP_HEADER_LEN)?;
    let seg = &packet[offset..];

    let data_offset = seg[12] >> 4;
    if data_offset < 5 {
        return Err(DecodeError::Malformed("TCP data offset below 5"));
    }
    let header_len = data_offset as usize * 4;
    need(packet.len(), offset + header_len)?;

    Ok(Transport::Tcp(TcpHeader {
        src_port: be16(seg, 0),
        dst_port: be16(seg, 2),
        seq: be32(seg, 4),
        ack: be32(seg, 8),
        flags: TcpFlags::from_byte(seg[13]),
        window: be16(seg, 14),
        data_offset,
        mss: parse_mss(&seg[TCP_HEADER_LEN..header_len]),
        payload_offset: offset + header_len,
        payload_len: seg.len() - header_len,
    }))
}

fn parse_mss(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            2 if i + 4 <= opts.len() && opts[i + 1] == 4 => {
                return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
            }
            _ => {
                if i + 1 < opts.len() && opts[i + 1] > 1 {
                    i += opts[i + 1] as usize;
                } else {
                    break;
                }
            }
        }
    }
    None
}

fn decode_udp(packet: &[u8], offset: usize) -> Result<Transport, DecodeError> {
    need(packet.len(), offset + UDP_HEADER_LEN)?;
    let seg = &packet[offset..];

    let length = be16(seg, 4);
    if (length as usize) < UDP_HEADER_LEN {
        return Err(DecodeError::Malformed("UDP length smaller than header"));
    }
    need(packet.len(), offset + length as usize)?;

    Ok(Transport::Udp(UdpHeader {
        src_port: be16(seg, 0),
        dst_port: be16(seg, 2),
        length,
        payload_offset: offset + UDP_HEADER_LEN,
        payload_len: length as usize - UDP_HEADER_LEN,
    }))
}

fn decode_icmp(packet: &[u8], offset: usize) -> Result<Transport, DecodeError> {
    need(packet.len(), offset + 4)?;
    Ok(Transport::Icmp(IcmpHeader {
        icmp_type: packet[offset],
        code: packet[offset + 1],
    }))
}

fn write_ipv4_header(pkt: &mut [u8], proto: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    let total_len = pkt.len() as u16;
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = DEFAULT_TTL;
    pkt[9] = proto;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let ip_cksum = ipv4_header_checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build IPv4 TCP packet
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let tcp_opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = TCP_HEADER_LEN + tcp_opts_len;
    let total_len = IPV4_HEADER_LEN + tcp_hdr_len + payload.len();

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, 6, *src.ip(), *dst.ip());

    let tcp = &mut pkt[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((tcp_hdr_len / 4) as u8) << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());

    if let (true, Some(mss_val)) = (flags.syn, mss) {
        tcp[20] = 2;
        tcp[21] = 4;
        tcp[22..24].copy_from_slice(&mss_val.to_be_bytes());
    }

    tcp[tcp_hdr_len..].copy_from_slice(payload);

    let cksum = transport_checksum(IpAddr::V4(*src.ip()), IpAddr::V4(*dst.ip()), 6, tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

/// Build IPv4 UDP packet
pub fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, 17, *src.ip(), *dst.ip());

    let udp = &mut pkt[IPV4_HEADER_LEN..];
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let cksum = udp_checksum(IpAddr::V4(*src.ip()), IpAddr::V4(*dst.ip()), udp);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

/// Build a reply to `packet` carrying `payload`.
///
/// The IPv4 header (options included) and the TCP/UDP header are copied
/// byte for byte; only addresses, ports, lengths and checksums change.
pub fn mirror_ipv4(packet: &[u8], payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let decoded = decode(packet)?;
    if decoded.version != 4 {
        return Err(DecodeError::UnsupportedVersion(decoded.version));
    }

    let ihl = decoded.header_len;
    let transport_len = match &decoded.transport {
        Transport::Tcp(t) => t.data_offset as usize * 4,
        Transport::Udp(_) => UDP_HEADER_LEN,
        _ => return Err(DecodeError::Malformed("mirror needs a TCP or UDP packet")),
    };

    let headers_len = ihl + transport_len;
    let total_len = headers_len + payload.len();
    if total_len > u16::MAX as usize {
        return Err(DecodeError::Malformed("mirrored packet exceeds 65535 bytes"));
    }

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&packet[..headers_len]);
    out.extend_from_slice(payload);

    // addresses and ports
    out[16..20].copy_from_slice(&packet[12..16]);
    out[12..16].copy_from_slice(&packet[16..20]);
    out[ihl..ihl + 2].copy_from_slice(&packet[ihl + 2..ihl + 4]);
    out[ihl + 2..ihl + 4].copy_from_slice(&packet[ihl..ihl + 2]);

    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[10..12].copy_from_slice(&[0, 0]);
    let ip_cksum = ipv4_header_checksum(&out[..ihl]);
    out[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let (src, dst) = (decoded.dst, decoded.src);
    let segment = &mut out[ihl..];
    match decoded.transport {
        Transport::Tcp(_) => {
            segment[16..18].copy_from_slice(&[0, 0]);
            let cksum = transport_checksum(src, dst, 6, segment);
            segment[16..18].copy_from_slice(&cksum.to_be_bytes());
        }
        _ => {
            let udp_len = segment.len() as u16;
            segment[4..6].copy_from_slice(&udp_len.to_be_bytes());
            segment[6..8].copy_from_slice(&[0, 0]);
            let cksum = udp_checksum(src, dst, segment);
            segment[6..8].copy_from_slice(&cksum.to_be_bytes());
        }
    }

    Ok(out)
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 ones'-complement checksum
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Checksum of an IPv4 header, treating its checksum field as zero
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    if header.len() < 12 {
        return internet_checksum(header);
    }
    let sum = sum_words(&header[..10], 0);
    fold(sum_words(&header[12..], sum))
}

fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u32 {
    let mut sum = match src {
        IpAddr::V4(a) => sum_words(&a.octets(), 0),
        IpAddr::V6(a) => sum_words(&a.octets(), 0),
    };
    sum = match dst {
        IpAddr::V4(a) => sum_words(&a.octets(), sum),
        IpAddr::V6(a) => sum_words(&a.octets(), sum),
    };
    sum + proto as u32 + (len >> 16) as u32 + (len & 0xFFFF) as u32
}

/// TCP/UDP checksum over the pseudo header and `segment`.
/// The segment's checksum field must be zero.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, proto: u8, segment: &[u8]) -> u16 {
    fold(sum_words(segment, pseudo_header_sum(src, dst, proto, segment.len())))
}

fn udp_checksum(src: IpAddr, dst: IpAddr, segment: &[u8]) -> u16 {
    let cksum = transport_checksum(src, dst, 17, segment);
    if cksum == 0 { 0xFFFF } else { cksum }
}

/// Check the IPv4 header checksum and, for TCP/UDP, the transport checksum
pub fn verify_ipv4(packet: &[u8]) -> bool {
    let decoded = match decode(packet) {
        Ok(d) if d.version == 4 => d,
        _ => return false,
    };
    let ihl = decoded.header_len;
    if internet_checksum(&packet[..ihl]) != 0 {
        return false;
    }

    let segment = &packet[ihl..decoded.total_len];
    let proto = match &decoded.transport {
        Transport::Tcp(_) => 6,
        Transport::Udp(u) => {
            if be16(segment, 6) == 0 {
                return true;
            }
            // UDP length may be shorter than the IP payload
            let sum = pseudo_header_sum(decoded.src, decoded.dst, 17, u.length as usize);
            return fold(sum_words(&segment[..u.length as usize], sum)) == 0;
        }
        _ => return true,
    };
    let sum = pseudo_header_sum(decoded.src, decoded.dst, proto, segment.len());
    fold(sum_words(segment, sum)) == 0
}
