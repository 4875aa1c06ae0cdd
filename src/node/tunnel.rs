//! The TUN device duplex node (§4.6): the only node that speaks raw IPv4
//! frames. Ingress decodes and dispatches upward; egress walks the batched
//! payload frame-by-frame, writing each IPv4 frame out to the device.

use crate::error::TunnelError;
use crate::ip::NetworkMessage;
use crate::message::Message;
use crate::node::{Node, NodeKind, NodeState};
use crate::reactor::{events, Reactor};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Command;
use std::sync::Arc;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;
const IFNAMSIZ: usize = 16;
const DEV_NET_TUN: &str = "/dev/net/tun";

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _padding: [u8; 22],
}

pub struct TunnelConfig {
    pub iface_name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            iface_name: "bats0".to_string(),
            address: Ipv4Addr::new(10, 10, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1500,
        }
    }
}

pub struct Tunnel {
    state: NodeState,
    fd: OwnedFd,
    mtu: usize,
}

impl Tunnel {
    pub fn open(name: impl Into<String>, config: &TunnelConfig) -> Result<Arc<Self>, TunnelError> {
        let fd = open_tun_device(&config.iface_name)?;
        configure_interface(&config.iface_name, config.address, config.netmask)?;

        Ok(Arc::new(Tunnel {
            state: NodeState::new(name, NodeKind::FullDuplex),
            fd,
            mtu: config.mtu,
        }))
    }

    /// Registers this tunnel's fd with the reactor for permanent,
    /// edge-triggered readability; the callback holds only a weak handle
    /// back into the node graph (§9 "Cyclic back-references").
    pub fn register_with_reactor(self: &Arc<Self>, reactor: &Reactor) {
        let weak = Arc::downgrade(self);
        let fd = self.fd.as_raw_fd();
        reactor.register(
            fd,
            events::READABLE,
            -1,
            Box::new(move |_mask| {
                let Some(tunnel) = weak.upgrade() else {
                    return;
                };
                tunnel.drain_reads();
            }),
        );
    }

    fn drain_reads(&self) {
        loop {
            match self.read_one_frame() {
                Ok(Some(raw)) => match NetworkMessage::decode(&raw) {
                    Some(_) => {
                        let msg = Message::ipv4(raw.len());
                        msg.reserve_header(0);
                        msg.fill(&raw);
                        self.dispatch(msg);
                    }
                    None => {
                        tracing::warn!(
                            node = self.state.name(),
                            "dropping non-ipv4 frame read from tunnel"
                        );
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(node = self.state.name(), "tunnel read error: {e}");
                    break;
                }
            }
        }
    }

    fn read_one_frame(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.mtu];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        buf.truncate(n as usize);
        Ok(Some(buf))
    }

    fn write_one_frame(&self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Node for Tunnel {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle_msg(&self, _msg: Message) {
        tracing::error!(
            node = self.state.name(),
            "tunnel received handle_msg; full-duplex nodes should only see fd_write"
        );
    }

    /// Walks the batched payload frame-by-frame using each frame's IPv4
    /// total-length field, writing every well-formed frame to the device.
    /// Stops (and warns) on a corrupt header or when fewer than 21 bytes
    /// remain — §8 testable property 11.
    fn fd_write(&self, msg: Message) {
        let payload = msg.payload_snapshot();
        let mut offset = 0usize;

        while payload.len() - offset > 20 {
            let frame_header = &payload[offset..];
            let Some(version) = NetworkMessage::ip_version(frame_header) else {
                break;
            };
            if version != 4 && version != 6 {
                tracing::warn!(
                    node = self.state.name(),
                    offset,
                    version,
                    "corrupt frame header during tunnel frame walk"
                );
                break;
            }
            let Some(frame_len) = NetworkMessage::frame_len(frame_header) else {
                break;
            };
            let frame_len = frame_len as usize;
            if frame_len == 0 || offset + frame_len > payload.len() {
                tracing::warn!(
                    node = self.state.name(),
                    offset,
                    frame_len,
                    "frame length overruns remaining payload during tunnel frame walk"
                );
                break;
            }

            let frame = &payload[offset..offset + frame_len];
            if let Err(e) = self.write_one_frame(frame) {
                tracing::warn!(node = self.state.name(), "tunnel write failed: {e}");
                break;
            }
            offset += frame_len;
        }
    }
}

fn open_tun_device(name: &str) -> Result<OwnedFd, TunnelError> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let path = CString::new(DEV_NET_TUN).expect("static path has no NUL bytes");
    let raw_fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if raw_fd < 0 {
        return Err(TunnelError::Open(DEV_NET_TUN, io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    let mut ifr = IfReq {
        name: [0u8; IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _padding: [0u8; 22],
    };
    let name_bytes = name.as_bytes();
    let copy_len = name_bytes.len().min(IFNAMSIZ - 1);
    ifr.name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

    let res = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut ifr as *mut IfReq) };
    if res < 0 {
        return Err(TunnelError::SetIff(io::Error::last_os_error()));
    }

    set_nonblocking(fd.as_raw_fd()).map_err(|e| TunnelError::Configure(e.to_string()))?;

    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Brings the interface up with the configured address/netmask and disables
/// reverse-path filtering, by shelling out to `ip`/`sysctl` the same way
/// the rest of the settings-driven bring-up sequence works outside the
/// `ioctl` call itself.
fn configure_interface(
    name: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Result<(), TunnelError> {
    let prefix_len = u32::from(netmask).count_ones();

    run_command(
        "ip",
        &[
            "addr",
            "add",
            &format!("{address}/{prefix_len}"),
            "dev",
            name,
        ],
    )?;
    run_command("ip", &["link", "set", name, "up"])?;
    run_command(
        "sysctl",
        &["-w", &format!("net.ipv4.conf.{name}.rp_filter=0")],
    )?;

    Ok(())
}

fn run_command(cmd: &str, args: &[&str]) -> Result<(), TunnelError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| TunnelError::Configure(format!("failed to spawn `{cmd}`: {e}")))?;
    if !output.status.success() {
        return Err(TunnelError::Configure(format!(
            "`{cmd} {}` failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    /// Builds a bare `Tunnel` around a socketpair fd, bypassing the real
    /// `/dev/net/tun` open sequence, so the frame-walk logic can be
    /// exercised without device privileges.
    fn test_tunnel() -> Arc<Tunnel> {
        use std::os::fd::FromRawFd;
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        let raw = a.as_raw_fd();
        std::mem::forget(a);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Arc::new(Tunnel {
            state: NodeState::new("tun", NodeKind::FullDuplex),
            fd,
            mtu: 1500,
        })
    }

    fn ipv4_frame(total_len: u16, version: u8) -> Vec<u8> {
        let mut buf = vec![0u8; total_len as usize];
        buf[0] = (version << 4) | 5;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf
    }

    #[test]
    fn frame_walk_writes_both_well_formed_frames() {
        let tunnel = test_tunnel();
        let mut payload = ipv4_frame(28, 4);
        payload.extend(ipv4_frame(24, 4));

        let msg = Message::new(payload.len());
        msg.reserve_header(0);
        msg.fill(&payload);

        // Just exercises the frame-walk bookkeeping without asserting on
        // the raw fd contents (a unix socket accepts arbitrary bytes).
        tunnel.fd_write(msg);
    }

    #[test]
    fn frame_walk_stops_on_corrupt_second_frame() {
        let tunnel = test_tunnel();
        let mut payload = ipv4_frame(28, 4);
        payload.extend(ipv4_frame(24, 9)); // corrupt version

        let msg = Message::new(payload.len());
        msg.reserve_header(0);
        msg.fill(&payload);

        tunnel.fd_write(msg);
        // No panic and the walk halts after the first frame; behavioural
        // assertion lives in the frame_len/ip_version unit tests in ip.rs.
    }

    #[test]
    fn dispatch_with_no_down_channels_drops_silently() {
        let tunnel = test_tunnel();
        let msg = Message::ipv4(16);
        tunnel.dispatch(msg);
    }

    #[test]
    fn dispatch_forwards_to_down_channel() {
        let tunnel = test_tunnel();
        let down = Arc::new(Channel::new("tun:collector", 4));
        tunnel.state().push_down_channel(down.clone());

        let msg = Message::ipv4(16);
        tunnel.dispatch(msg);
        assert!(down.try_dequeue().is_some());
    }
}
