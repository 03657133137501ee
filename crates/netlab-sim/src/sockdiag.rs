//! Established-TCP socket dump over `NETLINK_INET_DIAG`.
//!
//! The dump runs inside a chosen network namespace (a `/proc/<pid>/ns/net`
//! or `/var/run/netns/<name>` handle) and asks the kernel for the
//! `INET_DIAG_INFO` extension, so every socket comes back with its
//! `tcp_info` (RTT, cwnd, retransmissions...). Message encoding and
//! decoding are plain functions over byte slices; only
//! [`dump_tcp_sockets`] touches the kernel.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;

use crate::error::{NetlabError, Result};

// linux/netlink.h, linux/sock_diag.h, linux/inet_diag.h
const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x001;
const NLM_F_DUMP: u16 = 0x300;
const SOCK_DIAG_BY_FAMILY: u16 = 20;
const INET_DIAG_INFO: u16 = 2;
const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_MSG_LEN: usize = 72;
const RTA_HDRLEN: usize = 4;

const AF_INET: u8 = 2;
const IPPROTO_TCP: u8 = 6;
const TCP_ESTABLISHED: u8 = 1;

/// Shortest `tcp_info` we decode (up to `tcpi_total_retrans`).
const TCP_INFO_MIN_LEN: usize = 104;

const RECV_BUF_LEN: usize = 32 * 1024;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn u16_ne(b: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([b[off], b[off + 1]])
}

fn u32_ne(b: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn u64_ne(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_ne_bytes(raw)
}

fn ipv4_at(b: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(b[off], b[off + 1], b[off + 2], b[off + 3])
}

// ── Types ───────────────────────────────────────────────────────────

/// Subset of the kernel's `struct tcp_info`. Times are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub rto_us: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub pmtu: u32,
    pub rtt_us: u32,
    pub rttvar_us: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub total_retrans: u32,
    pub bytes_acked: Option<u64>,
    pub bytes_received: Option<u64>,
    pub min_rtt_us: Option<u32>,
    /// Bytes per second.
    pub delivery_rate: Option<u64>,
}

impl TcpInfo {
    /// Decodes the payload of an `INET_DIAG_INFO` attribute. Older kernels
    /// send a shorter struct, so the trailing fields are optional.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_INFO_MIN_LEN {
            return Err(NetlabError::Netlink(format!(
                "tcp_info too short: {} bytes",
                data.len()
            )));
        }
        let opt_u64 = |off: usize| (data.len() >= off + 8).then(|| u64_ne(data, off));
        let opt_u32 = |off: usize| (data.len() >= off + 4).then(|| u32_ne(data, off));

        Ok(Self {
            state: data[0],
            ca_state: data[1],
            retransmits: data[2],
            rto_us: u32_ne(data, 8),
            snd_mss: u32_ne(data, 16),
            rcv_mss: u32_ne(data, 20),
            unacked: u32_ne(data, 24),
            lost: u32_ne(data, 32),
            retrans: u32_ne(data, 36),
            pmtu: u32_ne(data, 60),
            rtt_us: u32_ne(data, 68),
            rttvar_us: u32_ne(data, 72),
            snd_ssthresh: u32_ne(data, 76),
            snd_cwnd: u32_ne(data, 80),
            total_retrans: u32_ne(data, 100),
            bytes_acked: opt_u64(120),
            bytes_received: opt_u64(128),
            min_rtt_us: opt_u32(148),
            delivery_rate: opt_u64(160),
        })
    }

    pub fn ca_state_name(&self) -> &'static str {
        match self.ca_state {
            0 => "open",
            1 => "disorder",
            2 => "cwr",
            3 => "recovery",
            4 => "loss",
            _ => "unknown",
        }
    }
}

/// One IPv4 TCP socket as reported by `SOCK_DIAG_BY_FAMILY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpSocketInfo {
    pub state: u8,
    pub src: Ipv4Addr,
    pub sport: u16,
    pub dst: Ipv4Addr,
    pub dport: u16,
    pub inode: u32,
    pub uid: u32,
    pub rqueue: u32,
    pub wqueue: u32,
    pub tcp_info: Option<TcpInfo>,
}

impl fmt::Display for TcpSocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=================================")?;
        writeln!(f, "sport  : {}", self.sport)?;
        writeln!(f, "dport  : {}", self.dport)?;
        writeln!(f, "src ip : {}", self.src)?;
        writeln!(f, "dst ip : {}", self.dst)?;
        write!(f, "inode  : {}", self.inode)?;
        if let Some(info) = &self.tcp_info {
            writeln!(f)?;
            writeln!(
                f,
                "rtt    : {:.3} ms (var {:.3} ms)",
                info.rtt_us as f64 / 1000.0,
                info.rttvar_us as f64 / 1000.0
            )?;
            if let Some(min_rtt) = info.min_rtt_us {
                writeln!(f, "min rtt: {:.3} ms", min_rtt as f64 / 1000.0)?;
            }
            writeln!(f, "cwnd   : {} (ssthresh {})", info.snd_cwnd, info.snd_ssthresh)?;
            writeln!(f, "mss    : {} / pmtu {}", info.snd_mss, info.pmtu)?;
            write!(
                f,
                "retrans: {} (total {}, lost {}) ca {}",
                info.retrans,
                info.total_retrans,
                info.lost,
                info.ca_state_name()
            )?;
            if let Some(rate) = info.delivery_rate {
                write!(f, "\nrate   : {:.3} Mbit/s", rate as f64 * 8.0 / 1e6)?;
            }
        }
        Ok(())
    }
}

/// Client-side filter on dumped sockets. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SocketFilter {
    pub src: Option<Ipv4Addr>,
    pub dst: Option<Ipv4Addr>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

impl SocketFilter {
    pub fn matches(&self, s: &TcpSocketInfo) -> bool {
        self.src.is_none_or(|ip| ip == s.src)
            && self.dst.is_none_or(|ip| ip == s.dst)
            && self.sport.is_none_or(|p| p == s.sport)
            && self.dport.is_none_or(|p| p == s.dport)
    }
}

// ── Codec ───────────────────────────────────────────────────────────

/// Builds the dump request: `nlmsghdr` + `inet_diag_req_v2` for
/// established IPv4 TCP sockets with `tcp_info` attached.
pub fn encode_request(seq: u32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;
    let mut buf = Vec::with_capacity(total);

    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel

    buf.push(AF_INET);
    buf.push(IPPROTO_TCP);
    buf.push(1u8 << (INET_DIAG_INFO - 1)); // idiag_ext
    buf.push(0);
    buf.extend_from_slice(&(1u32 << TCP_ESTABLISHED).to_ne_bytes());
    // inet_diag_sockid: ports, addresses, ifindex and cookie all wildcard
    buf.resize(total, 0);
    buf
}

/// Sockets decoded from one `recv` worth of netlink messages.
#[derive(Debug, Default)]
pub struct DumpChunk {
    pub sockets: Vec<TcpSocketInfo>,
    /// `NLMSG_DONE` was seen; the dump is complete.
    pub done: bool,
}

pub fn parse_dump(buf: &[u8]) -> Result<DumpChunk> {
    let mut chunk = DumpChunk::default();
    let mut off = 0;

    while buf.len() - off >= NLMSG_HDRLEN {
        let len = u32_ne(buf, off) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() - off {
            return Err(NetlabError::Netlink(format!(
                "truncated message: header says {} bytes, {} left",
                len,
                buf.len() - off
            )));
        }
        let msg_type = u16_ne(buf, off + 4);
        let payload = &buf[off + NLMSG_HDRLEN..off + len];

        match msg_type {
            NLMSG_DONE => {
                chunk.done = true;
                break;
            }
            NLMSG_ERROR => {
                if payload.len() < 4 {
                    return Err(NetlabError::Netlink("short NLMSG_ERROR".into()));
                }
                let errno = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                // errno 0 is an acknowledgement
                if errno != 0 {
                    let err = std::io::Error::from_raw_os_error(-errno);
                    return Err(NetlabError::Netlink(format!("kernel error: {}", err)));
                }
            }
            SOCK_DIAG_BY_FAMILY => chunk.sockets.push(parse_diag_msg(payload)?),
            _ => {}
        }

        off += align4(len);
        if off > buf.len() {
            break;
        }
    }

    Ok(chunk)
}

fn parse_diag_msg(p: &[u8]) -> Result<TcpSocketInfo> {
    if p.len() < INET_DIAG_MSG_LEN {
        return Err(NetlabError::Netlink(format!(
            "inet_diag_msg too short: {} bytes",
            p.len()
        )));
    }

    let mut info = TcpSocketInfo {
        state: p[1],
        sport: u16::from_be_bytes([p[4], p[5]]),
        dport: u16::from_be_bytes([p[6], p[7]]),
        src: ipv4_at(p, 8),
        dst: ipv4_at(p, 24),
        rqueue: u32_ne(p, 56),
        wqueue: u32_ne(p, 60),
        uid: u32_ne(p, 64),
        inode: u32_ne(p, 68),
        tcp_info: None,
    };

    let mut off = INET_DIAG_MSG_LEN;
    while p.len() - off >= RTA_HDRLEN {
        let rta_len = u16_ne(p, off) as usize;
        let rta_type = u16_ne(p, off + 2);
        if rta_len < RTA_HDRLEN || rta_len > p.len() - off {
            break;
        }
        if rta_type == INET_DIAG_INFO {
            info.tcp_info = Some(TcpInfo::parse(&p[off + RTA_HDRLEN..off + rta_len])?);
        }
        off += align4(rta_len);
        if off > p.len() {
            break;
        }
    }

    Ok(info)
}

// ── Kernel side ─────────────────────────────────────────────────────

/// Dumps established IPv4 TCP sockets of the namespace behind `netns`.
///
/// The namespace switch happens on a helper thread, so the calling
/// thread stays where it was. Needs `CAP_SYS_ADMIN`.
#[cfg(target_os = "linux")]
pub fn dump_tcp_sockets(netns: &Path, filter: &SocketFilter) -> Result<Vec<TcpSocketInfo>> {
    let ns_file = std::fs::File::open(netns)?;

    let joined = std::thread::scope(|s| s.spawn(|| dump_in_netns(&ns_file)).join());
    let sockets =
        joined.map_err(|_| NetlabError::Netlink("diagnostics thread panicked".into()))??;

    Ok(sockets.into_iter().filter(|s| filter.matches(s)).collect())
}

#[cfg(not(target_os = "linux"))]
pub fn dump_tcp_sockets(_netns: &Path, _filter: &SocketFilter) -> Result<Vec<TcpSocketInfo>> {
    Err(NetlabError::Netlink("socket diagnostics need Linux".into()))
}

#[cfg(target_os = "linux")]
fn dump_in_netns(ns_file: &std::fs::File) -> Result<Vec<TcpSocketInfo>> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    // The netlink socket must be opened after the switch
    if unsafe { libc::setns(ns_file.as_raw_fd(), libc::CLONE_NEWNET) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    let raw = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_SOCK_DIAG,
        )
    };
    if raw < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let request = encode_request(1);
    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            request.as_ptr() as *const libc::c_void,
            request.len(),
            0,
            &sa as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut sockets = Vec::new();
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let n = unsafe {
            libc::recv(
                sock.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if n == 0 {
            break;
        }
        let chunk = parse_dump(&buf[..n as usize])?;
        sockets.extend(chunk.sockets);
        if chunk.done {
            break;
        }
    }

    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlmsg(msg_type: u16, payload: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDRLEN + payload.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(len as u32).to_ne_bytes());
        out.extend_from_slice(&msg_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes());
        out.extend_from_slice(&7u32.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize(align4(out.len()), 0);
        out
    }

    fn tcp_info_bytes(len: usize) -> Vec<u8> {
        let mut ti = vec![0u8; len];
        ti[0] = TCP_ESTABLISHED;
        ti[1] = 3; // recovery
        ti[68..72].copy_from_slice(&200_500u32.to_ne_bytes());
        ti[72..76].copy_from_slice(&1_250u32.to_ne_bytes());
        ti[80..84].copy_from_slice(&10u32.to_ne_bytes());
        ti[100..104].copy_from_slice(&4u32.to_ne_bytes());
        if len >= 168 {
            ti[148..152].copy_from_slice(&200_100u32.to_ne_bytes());
            ti[160..168].copy_from_slice(&1_250_000u64.to_ne_bytes());
        }
        ti
    }

    fn diag_msg(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, info: Option<Vec<u8>>) -> Vec<u8> {
        let mut p = vec![0u8; INET_DIAG_MSG_LEN];
        p[0] = AF_INET;
        p[1] = TCP_ESTABLISHED;
        p[4..6].copy_from_slice(&sport.to_be_bytes());
        p[6..8].copy_from_slice(&dport.to_be_bytes());
        p[8..12].copy_from_slice(&src);
        p[24..28].copy_from_slice(&dst);
        p[68..72].copy_from_slice(&4242u32.to_ne_bytes());
        if let Some(info) = info {
            let rta_len = (RTA_HDRLEN + info.len()) as u16;
            p.extend_from_slice(&rta_len.to_ne_bytes());
            p.extend_from_slice(&INET_DIAG_INFO.to_ne_bytes());
            p.extend_from_slice(&info);
            p.resize(align4(p.len()), 0);
        }
        p
    }

    #[test]
    fn request_layout() {
        let req = encode_request(9);
        assert_eq!(req.len(), 72);
        assert_eq!(u32_ne(&req, 0), 72);
        assert_eq!(u16_ne(&req, 4), SOCK_DIAG_BY_FAMILY);
        assert_eq!(u16_ne(&req, 6), 0x301);
        assert_eq!(u32_ne(&req, 8), 9);
        assert_eq!(&req[16..20], &[AF_INET, IPPROTO_TCP, 0b10, 0]);
        assert_eq!(u32_ne(&req, 20), 0b10);
        assert!(req[24..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parses_socket_with_tcp_info() {
        let mut buf = nlmsg(
            SOCK_DIAG_BY_FAMILY,
            &diag_msg([10, 0, 1, 101], 41000, [10, 0, 2, 101], 5001, Some(tcp_info_bytes(232))),
        );
        buf.extend(nlmsg(NLMSG_DONE, &0i32.to_ne_bytes()));

        let chunk = parse_dump(&buf).unwrap();
        assert!(chunk.done);
        assert_eq!(chunk.sockets.len(), 1);

        let s = &chunk.sockets[0];
        assert_eq!(s.src, Ipv4Addr::new(10, 0, 1, 101));
        assert_eq!(s.sport, 41000);
        assert_eq!(s.dst, Ipv4Addr::new(10, 0, 2, 101));
        assert_eq!(s.dport, 5001);
        assert_eq!(s.inode, 4242);

        let ti = s.tcp_info.as_ref().unwrap();
        assert_eq!(ti.rtt_us, 200_500);
        assert_eq!(ti.snd_cwnd, 10);
        assert_eq!(ti.total_retrans, 4);
        assert_eq!(ti.min_rtt_us, Some(200_100));
        assert_eq!(ti.delivery_rate, Some(1_250_000));
        assert_eq!(ti.ca_state_name(), "recovery");
    }

    #[test]
    fn old_kernel_tcp_info_has_no_extras() {
        let ti = TcpInfo::parse(&tcp_info_bytes(TCP_INFO_MIN_LEN)).unwrap();
        assert_eq!(ti.snd_cwnd, 10);
        assert_eq!(ti.min_rtt_us, None);
        assert_eq!(ti.delivery_rate, None);
        assert!(TcpInfo::parse(&[0u8; 40]).is_err());
    }

    #[test]
    fn multi_part_dump_without_done() {
        let mut buf = nlmsg(SOCK_DIAG_BY_FAMILY, &diag_msg([10, 0, 1, 101], 1, [10, 0, 2, 101], 2, None));
        buf.extend(nlmsg(SOCK_DIAG_BY_FAMILY, &diag_msg([10, 0, 1, 102], 3, [10, 0, 2, 101], 4, None)));

        let chunk = parse_dump(&buf).unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.sockets.len(), 2);
        assert!(chunk.sockets.iter().all(|s| s.tcp_info.is_none()));
    }

    #[test]
    fn kernel_error_is_reported() {
        let buf = nlmsg(NLMSG_ERROR, &(-libc::EPERM).to_ne_bytes());
        let err = parse_dump(&buf).unwrap_err();
        assert!(matches!(err, NetlabError::Netlink(_)));

        let ack = nlmsg(NLMSG_ERROR, &0i32.to_ne_bytes());
        assert!(parse_dump(&ack).unwrap().sockets.is_empty());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut buf = nlmsg(SOCK_DIAG_BY_FAMILY, &diag_msg([1, 1, 1, 1], 1, [2, 2, 2, 2], 2, None));
        buf.truncate(40);
        assert!(parse_dump(&buf).is_err());
    }

    #[test]
    fn filter_matches_fields() {
        let s = TcpSocketInfo {
            state: TCP_ESTABLISHED,
            src: Ipv4Addr::new(10, 0, 1, 101),
            sport: 41000,
            dst: Ipv4Addr::new(10, 0, 2, 101),
            dport: 5001,
            inode: 1,
            uid: 0,
            rqueue: 0,
            wqueue: 0,
            tcp_info: None,
        };
        assert!(SocketFilter::default().matches(&s));
        assert!(SocketFilter {
            dport: Some(5001),
            src: Some(Ipv4Addr::new(10, 0, 1, 101)),
            ..Default::default()
        }
        .matches(&s));
        assert!(!SocketFilter {
            sport: Some(5001),
            ..Default::default()
        }
        .matches(&s));
    }

    #[test]
    fn display_starts_like_a_report_block() {
        let chunk = parse_dump(&nlmsg(
            SOCK_DIAG_BY_FAMILY,
            &diag_msg([10, 0, 1, 101], 41000, [10, 0, 2, 101], 5001, None),
        ))
        .unwrap();
        let text = chunk.sockets[0].to_string();
        assert_eq!(
            text,
            "=================================\n\
             sport  : 41000\n\
             dport  : 5001\n\
             src ip : 10.0.1.101\n\
             dst ip : 10.0.2.101\n\
             inode  : 4242"
        );
    }
}
