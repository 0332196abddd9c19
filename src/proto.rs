//! Framed binary protocol on the local socket.
//!
//! Every request and response starts with a 32-bit protocol version and a
//! 32-bit action code. Response records are framed between `RESULT_BEGIN`
//! markers and a final `RESULT_END`. All integers are little-endian signed
//! 32-bit values; strings carry a length prefix and no terminator.
//!
//! The reader validates every length against a caller-supplied ceiling so a
//! misbehaving client cannot make the daemon allocate unbounded memory. A
//! short read or EOF is reported as [`NsdError::Disconnect`] only when it
//! happens on a request boundary; inside a frame it is a protocol error.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::result::{NsdError, Result};

/// Protocol version; a mismatch is fatal for the connection.
pub const PROTO_VERSION: i32 = 0x0000_0002;

/// Start-of-record marker inside a response stream.
pub const RESULT_BEGIN: i32 = 1;
/// End-of-results marker; terminates every response stream.
pub const RESULT_END: i32 = 2;

/// Address family codes used in typed address fields.
pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 10;

/// Common field size ceilings.
pub const LIMIT_NAME: i32 = 256;
pub const LIMIT_PASSWORD: i32 = 128;
pub const LIMIT_HOSTNAME: i32 = 256;
pub const LIMIT_DN: i32 = 512;
pub const LIMIT_ADDRESS: i32 = 16;

/// Request action codes. The numeric layout groups actions by database in
/// the high half-word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Action {
    ConfigGet = 0x0001_0001,
    AliasByName = 0x0002_0001,
    AliasAll = 0x0002_0008,
    EtherByName = 0x0003_0001,
    EtherByEther = 0x0003_0002,
    EtherAll = 0x0003_0008,
    GroupByName = 0x0004_0001,
    GroupByGid = 0x0004_0002,
    GroupByMember = 0x0004_0006,
    GroupAll = 0x0004_0008,
    HostByName = 0x0005_0001,
    HostByAddr = 0x0005_0002,
    HostAll = 0x0005_0008,
    NetgroupByName = 0x0006_0001,
    NetgroupAll = 0x0006_0008,
    NetworkByName = 0x0007_0001,
    NetworkByAddr = 0x0007_0002,
    NetworkAll = 0x0007_0008,
    PasswdByName = 0x0008_0001,
    PasswdByUid = 0x0008_0002,
    PasswdAll = 0x0008_0008,
    ProtocolByName = 0x0009_0001,
    ProtocolByNumber = 0x0009_0002,
    ProtocolAll = 0x0009_0008,
    RpcByName = 0x000a_0001,
    RpcByNumber = 0x000a_0002,
    RpcAll = 0x000a_0008,
    ServiceByName = 0x000b_0001,
    ServiceByNumber = 0x000b_0002,
    ServiceAll = 0x000b_0008,
    ShadowByName = 0x000c_0001,
    ShadowAll = 0x000c_0008,
    PamAuthc = 0x000d_0001,
    PamAuthz = 0x000d_0002,
    PamSessOpen = 0x000d_0003,
    PamSessClose = 0x000d_0004,
    PamPwMod = 0x000d_0005,
    UserMod = 0x000e_0001,
    AutomountByName = 0x000f_0001,
    AutomountAll = 0x000f_0008,
}

impl Action {
    pub fn from_code(code: i32) -> Option<Action> {
        use Action::*;
        let action = match code {
            0x0001_0001 => ConfigGet,
            0x0002_0001 => AliasByName,
            0x0002_0008 => AliasAll,
            0x0003_0001 => EtherByName,
            0x0003_0002 => EtherByEther,
            0x0003_0008 => EtherAll,
            0x0004_0001 => GroupByName,
            0x0004_0002 => GroupByGid,
            0x0004_0006 => GroupByMember,
            0x0004_0008 => GroupAll,
            0x0005_0001 => HostByName,
            0x0005_0002 => HostByAddr,
            0x0005_0008 => HostAll,
            0x0006_0001 => NetgroupByName,
            0x0006_0008 => NetgroupAll,
            0x0007_0001 => NetworkByName,
            0x0007_0002 => NetworkByAddr,
            0x0007_0008 => NetworkAll,
            0x0008_0001 => PasswdByName,
            0x0008_0002 => PasswdByUid,
            0x0008_0008 => PasswdAll,
            0x0009_0001 => ProtocolByName,
            0x0009_0002 => ProtocolByNumber,
            0x0009_0008 => ProtocolAll,
            0x000a_0001 => RpcByName,
            0x000a_0002 => RpcByNumber,
            0x000a_0008 => RpcAll,
            0x000b_0001 => ServiceByName,
            0x000b_0002 => ServiceByNumber,
            0x000b_0008 => ServiceAll,
            0x000c_0001 => ShadowByName,
            0x000c_0008 => ShadowAll,
            0x000d_0001 => PamAuthc,
            0x000d_0002 => PamAuthz,
            0x000d_0003 => PamSessOpen,
            0x000d_0004 => PamSessClose,
            0x000d_0005 => PamPwMod,
            0x000e_0001 => UserMod,
            0x000f_0001 => AutomountByName,
            0x000f_0008 => AutomountAll,
            _ => return None,
        };
        Some(action)
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// PAM result codes carried in PAM responses.
pub mod pam_rc {
    pub const SUCCESS: i32 = 0;
    pub const PERM_DENIED: i32 = 6;
    pub const AUTH_ERR: i32 = 7;
    pub const CRED_UNAVAIL: i32 = 8;
    pub const ACCT_EXPIRED: i32 = 9;
    pub const NEW_AUTHTOK_REQD: i32 = 12;
    pub const AUTHTOK_ERR: i32 = 20;
    pub const IGNORE: i32 = 25;
    pub const AUTHTOK_EXPIRED: i32 = 27;
}

/// Record types in netgroup responses.
pub const NETGROUP_TYPE_TRIPLE: i32 = 1;
pub const NETGROUP_TYPE_NETGROUP: i32 = 2;

/// Field tags in usermod requests and responses.
pub mod usermod_field {
    pub const END: i32 = 0;
    pub const RESULT: i32 = 1;
    pub const FULLNAME: i32 = 2;
    pub const ROOMNUMBER: i32 = 3;
    pub const WORKPHONE: i32 = 4;
    pub const HOMEPHONE: i32 = 5;
    pub const OTHER: i32 = 6;
    pub const HOMEDIR: i32 = 7;
    pub const SHELL: i32 = 8;
}

/// Option codes for CONFIG_GET requests.
pub mod config_option {
    pub const PAM_PASSWORD_PROHIBIT_MESSAGE: i32 = 852;
}

/// Buffered protocol stream over a connected socket.
///
/// The generic parameter allows tests to exercise the codec over an
/// in-memory duplex stream.
pub struct ProtoStream<S> {
    inner: BufStream<S>,
    /// True until the first byte of the current request has been read;
    /// EOF at that point is a clean disconnect rather than a framing error.
    at_boundary: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ProtoStream<S> {
    pub fn new(stream: S) -> ProtoStream<S> {
        ProtoStream {
            inner: BufStream::new(stream),
            at_boundary: true,
        }
    }

    async fn read_raw_i32(&mut self) -> Result<i32> {
        let at_boundary = self.at_boundary;
        self.at_boundary = false;
        match self.inner.read_i32_le().await {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && at_boundary => {
                Err(NsdError::Disconnect)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(NsdError::proto("short read"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        self.read_raw_i32().await
    }

    /// Read a length-prefixed string, rejecting lengths above `limit`.
    pub async fn read_string(&mut self, limit: i32) -> Result<String> {
        let len = self.read_raw_i32().await?;
        if len < 0 || len > limit {
            return Err(NsdError::proto(format!(
                "string length {} exceeds limit {}",
                len, limit
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => NsdError::proto("short read in string"),
                _ => NsdError::from(e),
            })?;
        String::from_utf8(buf).map_err(|_| NsdError::proto("string is not valid UTF-8"))
    }

    /// Read a fixed-size binary field (e.g. an ethernet address).
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => NsdError::proto("short read in bytes"),
                _ => NsdError::from(e),
            })?;
        self.at_boundary = false;
        Ok(buf)
    }

    /// Read a typed network address: family, length, raw bytes.
    pub async fn read_address(&mut self) -> Result<(i32, Vec<u8>)> {
        let family = self.read_raw_i32().await?;
        let len = self.read_raw_i32().await?;
        if len < 0 || len > LIMIT_ADDRESS {
            return Err(NsdError::proto(format!("address length {} out of range", len)));
        }
        let buf = self.read_bytes(len as usize).await?;
        Ok((family, buf))
    }

    /// Read and validate a request header, returning the action.
    pub async fn read_request_header(&mut self) -> Result<Action> {
        let version = self.read_raw_i32().await?;
        if version != PROTO_VERSION {
            return Err(NsdError::proto(format!(
                "wrong protocol version {:#x} (expected {:#x})",
                version, PROTO_VERSION
            )));
        }
        let code = self.read_raw_i32().await?;
        Action::from_code(code)
            .ok_or_else(|| NsdError::proto(format!("unknown action {:#010x}", code)))
    }

    pub async fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_i32_le(value).await?;
        Ok(())
    }

    pub async fn write_string(&mut self, value: &str) -> Result<()> {
        self.inner.write_i32_le(value.len() as i32).await?;
        self.inner.write_all(value.as_bytes()).await?;
        Ok(())
    }

    /// Write a count-prefixed string list.
    pub async fn write_stringlist(&mut self, values: &[String]) -> Result<()> {
        self.inner.write_i32_le(values.len() as i32).await?;
        for value in values {
            self.write_string(value).await?;
        }
        Ok(())
    }

    /// Write a string list terminated by an empty entry.
    pub async fn write_stringlist_nullterm(&mut self, values: &[String]) -> Result<()> {
        for value in values {
            if value.is_empty() {
                continue;
            }
            self.write_string(value).await?;
        }
        self.inner.write_i32_le(0).await?;
        Ok(())
    }

    pub async fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.inner.write_all(value).await?;
        Ok(())
    }

    /// Write a typed network address.
    pub async fn write_address(&mut self, family: i32, addr: &[u8]) -> Result<()> {
        self.inner.write_i32_le(family).await?;
        self.inner.write_i32_le(addr.len() as i32).await?;
        self.inner.write_all(addr).await?;
        Ok(())
    }

    /// Write the response header echoing the action code.
    pub async fn write_response_header(&mut self, action: Action) -> Result<()> {
        self.inner.write_i32_le(PROTO_VERSION).await?;
        self.inner.write_i32_le(action.code()).await?;
        Ok(())
    }

    pub async fn begin_record(&mut self) -> Result<()> {
        self.write_i32(RESULT_BEGIN).await
    }

    pub async fn end_results(&mut self) -> Result<()> {
        self.write_i32(RESULT_END).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Arm the boundary marker before reading the next request.
    pub fn start_request(&mut self) {
        self.at_boundary = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn pair() -> (ProtoStream<tokio::io::DuplexStream>, ProtoStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        (ProtoStream::new(a), ProtoStream::new(b))
    }

    #[tokio::test]
    async fn string_roundtrip() {
        let (mut client, mut server) = pair().await;
        client.write_string("alice").await.unwrap();
        client.flush().await.unwrap();
        let s = server.read_string(LIMIT_NAME).await.unwrap();
        assert_eq!(s, "alice");
    }

    #[tokio::test]
    async fn oversized_string_is_protocol_error() {
        let (mut client, mut server) = pair().await;
        client.write_i32(LIMIT_NAME + 1).await.unwrap();
        client.flush().await.unwrap();
        match server.read_string(LIMIT_NAME).await {
            Err(NsdError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn negative_length_is_protocol_error() {
        let (mut client, mut server) = pair().await;
        client.write_i32(-4).await.unwrap();
        client.flush().await.unwrap();
        assert!(matches!(
            server.read_string(LIMIT_NAME).await,
            Err(NsdError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn header_roundtrip() {
        let (mut client, mut server) = pair().await;
        client.write_i32(PROTO_VERSION).await.unwrap();
        client.write_i32(Action::PasswdByName.code()).await.unwrap();
        client.flush().await.unwrap();
        let action = server.read_request_header().await.unwrap();
        assert_eq!(action, Action::PasswdByName);
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal() {
        let (mut client, mut server) = pair().await;
        client.write_i32(99).await.unwrap();
        client.write_i32(Action::PasswdByName.code()).await.unwrap();
        client.flush().await.unwrap();
        assert!(matches!(
            server.read_request_header().await,
            Err(NsdError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn eof_on_boundary_is_disconnect() {
        let (client, mut server) = pair().await;
        drop(client);
        server.start_request();
        assert!(matches!(
            server.read_request_header().await,
            Err(NsdError::Disconnect)
        ));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_protocol_error() {
        let (mut client, mut server) = pair().await;
        client.write_i32(PROTO_VERSION).await.unwrap();
        client.flush().await.unwrap();
        drop(client);
        assert!(matches!(
            server.read_request_header().await,
            Err(NsdError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn address_roundtrip() {
        let (mut client, mut server) = pair().await;
        client.write_address(AF_INET, &[10, 0, 0, 1]).await.unwrap();
        client.flush().await.unwrap();
        let (family, addr) = server.read_address().await.unwrap();
        assert_eq!(family, AF_INET);
        assert_eq!(addr, vec![10, 0, 0, 1]);
    }

    #[tokio::test]
    async fn stringlist_variants() {
        let (mut client, mut server) = pair().await;
        let values = vec!["a".to_string(), "b".to_string()];
        client.write_stringlist(&values).await.unwrap();
        client.write_stringlist_nullterm(&values).await.unwrap();
        client.flush().await.unwrap();
        // count-prefixed
        assert_eq!(server.read_i32().await.unwrap(), 2);
        assert_eq!(server.read_string(16).await.unwrap(), "a");
        assert_eq!(server.read_string(16).await.unwrap(), "b");
        // null-terminated
        assert_eq!(server.read_string(16).await.unwrap(), "a");
        assert_eq!(server.read_string(16).await.unwrap(), "b");
        assert_eq!(server.read_string(16).await.unwrap(), "");
    }
}
