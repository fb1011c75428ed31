use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Target {
    pub host: String,
    pub port: u16,
}

/// Runs the server side of the SOCKS5 handshake: no-auth greeting, CONNECT
/// command only. On success the caller owns the stream again, positioned at
/// the first tunnelled byte.
pub async fn accept_socks5<S>(stream: &mut S) -> io::Result<Option<Socks5Target>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0_u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5_VERSION {
        return Ok(None);
    }
    let mut methods = vec![0_u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0_u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION || request[1] != CMD_CONNECT {
        stream
            .write_all(&reply(REP_COMMAND_NOT_SUPPORTED))
            .await?;
        return Ok(None);
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0_u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0_u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0_u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut addr = [0_u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => {
            stream
                .write_all(&reply(REP_ADDRESS_TYPE_NOT_SUPPORTED))
                .await?;
            return Ok(None);
        }
    };

    let mut port_bytes = [0_u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    stream.write_all(&reply(REP_SUCCESS)).await?;
    Ok(Some(Socks5Target { host, port }))
}

fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::accept_socks5;

    #[tokio::test]
    async fn accepts_domain_connect() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let target = accept_socks5(&mut server).await.expect("handshake");
            (target, server)
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0_u8; 2];
        client.read_exact(&mut method).await.expect("method");
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 12];
        request.extend_from_slice(b"example.test");
        request.extend_from_slice(&443_u16.to_be_bytes());
        client.write_all(&request).await.expect("request");

        let mut response = [0_u8; 10];
        client.read_exact(&mut response).await.expect("response");
        assert_eq!(response[1], 0x00);

        let (target, _server) = server_task.await.expect("server task");
        let target = target.expect("target");
        assert_eq!(target.host, "example.test");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn accepts_ipv4_connect() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move { accept_socks5(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0_u8; 2];
        client.read_exact(&mut method).await.expect("method");

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7];
        request.extend_from_slice(&8443_u16.to_be_bytes());
        client.write_all(&request).await.expect("request");
        let mut response = [0_u8; 10];
        client.read_exact(&mut response).await.expect("response");

        let target = server_task
            .await
            .expect("server task")
            .expect("handshake")
            .expect("target");
        assert_eq!(target.host, "10.0.0.7");
        assert_eq!(target.port, 8443);
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move { accept_socks5(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0_u8; 2];
        client.read_exact(&mut method).await.expect("method");

        // BIND command
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x01, 0xbb])
            .await
            .expect("request");
        let mut response = [0_u8; 10];
        client.read_exact(&mut response).await.expect("response");
        assert_eq!(response[1], 0x07);

        let target = server_task.await.expect("server task").expect("handshake");
        assert!(target.is_none());
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move { accept_socks5(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0_u8; 2];
        client.read_exact(&mut method).await.expect("method");

        client
            .write_all(&[0x05, 0x01, 0x00, 0x09, 0, 0])
            .await
            .expect("request");
        let mut response = [0_u8; 10];
        client.read_exact(&mut response).await.expect("response");
        assert_eq!(response[1], 0x08);

        let target = server_task.await.expect("server task").expect("handshake");
        assert!(target.is_none());
    }
}
