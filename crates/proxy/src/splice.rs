/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::{IpAddr, SocketAddr};

use common::listener::SessionStream;
use tokio::{io::AsyncWriteExt, net::TcpStream};

/// Builds a PROXY protocol v2 header for the observed client address.
pub fn proxy_v2_header(client: SocketAddr, server: SocketAddr) -> Vec<u8> {
    const SIGNATURE: [u8; 12] = [
        0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
    ];
    let mut header = Vec::with_capacity(52);
    header.extend_from_slice(&SIGNATURE);
    // Version 2, PROXY command.
    header.push(0x21);

    match (client.ip(), server.ip()) {
        (IpAddr::V4(client_ip), IpAddr::V4(server_ip)) => {
            // AF_INET, STREAM.
            header.push(0x11);
            header.extend_from_slice(&12u16.to_be_bytes());
            header.extend_from_slice(&client_ip.octets());
            header.extend_from_slice(&server_ip.octets());
            header.extend_from_slice(&client.port().to_be_bytes());
            header.extend_from_slice(&server.port().to_be_bytes());
        }
        _ => {
            // AF_INET6, STREAM; mapped addresses for mixed families.
            header.push(0x21);
            header.extend_from_slice(&36u16.to_be_bytes());
            header.extend_from_slice(&to_v6(client.ip()).octets());
            header.extend_from_slice(&to_v6(server.ip()).octets());
            header.extend_from_slice(&client.port().to_be_bytes());
            header.extend_from_slice(&server.port().to_be_bytes());
        }
    }
    header
}

fn to_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}

/// Bidirectional splice between client and backend, bounded by the session
/// timeout. Returns the bytes moved in each direction.
pub async fn splice<T: SessionStream>(
    client: &mut T,
    backend: &mut TcpStream,
    timeout: std::time::Duration,
) -> (u64, u64) {
    let result = tokio::time::timeout(
        timeout,
        tokio::io::copy_bidirectional(client, backend),
    )
    .await;
    let (to_backend, to_client) = match result {
        Ok(Ok(counts)) => counts,
        Ok(Err(_)) | Err(_) => (0, 0),
    };
    let _ = backend.shutdown().await;
    let _ = client.shutdown().await;
    (to_backend, to_client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_header_layout() {
        let header = proxy_v2_header(
            "203.0.113.9:45000".parse().unwrap(),
            "10.0.0.1:143".parse().unwrap(),
        );
        assert_eq!(header.len(), 28);
        assert_eq!(header[12], 0x21);
        assert_eq!(header[13], 0x11);
        assert_eq!(&header[14..16], &12u16.to_be_bytes());
        assert_eq!(&header[16..20], &[203, 0, 113, 9]);
        assert_eq!(&header[20..24], &[10, 0, 0, 1]);
        assert_eq!(&header[24..26], &45000u16.to_be_bytes());
        assert_eq!(&header[26..28], &143u16.to_be_bytes());
    }

    #[test]
    fn mixed_families_use_v6() {
        let header = proxy_v2_header(
            "[2001:db8::1]:45000".parse().unwrap(),
            "10.0.0.1:143".parse().unwrap(),
        );
        assert_eq!(header.len(), 52);
        assert_eq!(header[13], 0x21);
    }
}
