use std::{
    borrow::Cow,
    convert::TryInto,
    fmt,
    io,
    path::Path,
    str,
};

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use log::debug;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_LENGTH, RANGE},
    RequestBuilder, Response,
    StatusCode,
};
use thiserror::Error;
use xmltree::{Element, XMLNode};

use crate::{
    crypto::{self, CryptoError, FusAes256, FusKeys},
    error::Error,
    identifier::{FirmwareIdentifier, FwVersion, ParseFwVersionError},
};

const FUS_BASE_URL: &str = "https://neofussvr.sslcs.cdngc.net";
const DOWNLOAD_BASE_URL: &str = "http://cloud-neofussvr.sslcs.cdngc.net";
const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

fn to_utf8_or_error_string(data: &[u8]) -> &str {
    str::from_utf8(data).unwrap_or(NON_UTF8_MSG)
}

#[derive(Debug, Error)]
pub enum FusError {
    #[error("Server did not provide a nonce value")]
    NonceNotFound,
    #[error("Nonce is not exactly 16 bytes")]
    NonceInvalidSize,
    #[error("Request was rejected with HTTP {0}")]
    Rejected(StatusCode),
    #[error("Expected a successful HTTP status, but got HTTP {0}")]
    BadHttpResponse(StatusCode),
    #[error("FUS returned status {0}")]
    FusStatus(String),
    #[error("Received malformed FUS response: {0}")]
    FusBadResponse(String),
    #[error("Could not find field '{0}' in FUS response")]
    FusMissingField(String),
    #[error("Could not parse the value for field '{0}': '{1}'")]
    FusBadField(String, String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Failed to parse version string: {0}")]
    VersionParseError(#[from] ParseFwVersionError),
    #[error("Failed to decode base64 data: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),
    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("XML parse error: {0}")]
    XmlParseError(#[from] xmltree::ParseError),
    #[error("XML error: {0}")]
    XmlError(#[from] xmltree::Error),
}

impl From<FusError> for Error {
    fn from(e: FusError) -> Self {
        let unauthorized = matches!(&e, FusError::FusStatus(s) if s == "401" || s == "403");

        match e {
            FusError::NonceNotFound
            | FusError::NonceInvalidSize
            | FusError::Rejected(_)
            | FusError::CryptoError(_)
            | FusError::Base64DecodeError(_) => Self::Authentication(e.into()),
            FusError::FusStatus(_) if unauthorized => Self::Authentication(e.into()),
            FusError::FusStatus(_) => Self::NotFound(e.to_string()),
            FusError::BadHttpResponse(_)
            | FusError::RequestError(_) => Self::Network(e.into()),
            FusError::FusBadResponse(_)
            | FusError::FusMissingField(_)
            | FusError::FusBadField(_, _)
            | FusError::VersionParseError(_)
            | FusError::XmlParseError(_)
            | FusError::XmlError(_) => Self::Protocol(e.into()),
        }
    }
}

/// The Authorization header value for FUS requests.
#[derive(Debug)]
struct Authorization {
    pub nonce: String,
    pub signature: String,
}

impl Authorization {
    /// Unsigned header, used to request the initial nonce.
    fn unsigned() -> Self {
        Self::with_signature("")
    }

    fn with_signature(signature: &str) -> Self {
        Self {
            nonce: String::new(),
            signature: signature.to_owned(),
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the new auth mechanism (encrypted nonces) is supported
        write!(
            f,
            "FUS nonce=\"{}\", signature=\"{}\", nc=\"\", type=\"\", realm=\"\", newauth=\"1\"",
            self.nonce,
            self.signature,
        )
    }
}

/// A server-issued FUS nonce. The key derivations that consume it index into
/// it assuming exactly 16 bytes, so anything else is rejected.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Nonce {
    data: [u8; 16],
}

impl Nonce {
    pub fn from_slice(data: &[u8]) -> Result<Self, FusError> {
        Ok(Self {
            data: data.try_into().map_err(|_| FusError::NonceInvalidSize)?,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Create instance from a fixed-key-encrypted, base64-encoded nonce value.
    pub fn from_encrypted(keys: &FusKeys, data: &[u8]) -> Result<Self, FusError> {
        let decoded = STANDARD.decode(data)?;
        let plaintext = FusAes256::new(&keys.fixed_key).decrypt(&decoded)?;
        Self::from_slice(&plaintext)
    }

    pub fn to_encrypted(self, keys: &FusKeys) -> String {
        STANDARD.encode(FusAes256::new(&keys.fixed_key).encrypt(&self.data))
    }

    /// Signature proving knowledge of the keys, sent in the Authorization
    /// header of every request after the handshake.
    fn to_signature(self, keys: &FusKeys) -> String {
        let key = keys.get_flexible_key(self.as_slice());
        STANDARD.encode(FusAes256::new(&key).encrypt(self.as_slice()))
    }

    fn to_authorization(self, keys: &FusKeys, include_nonce: bool) -> Authorization {
        let mut auth = Authorization::with_signature(&self.to_signature(keys));
        if include_nonce {
            auth.nonce = self.to_encrypted(keys);
        }
        auth
    }

    fn logic_check_data(self, data: &[u8]) -> String {
        crypto::logic_check(self.as_slice(), data)
    }

    /// Logic check over a file name: everything before the first `.`, limited
    /// to the last 16 bytes.
    fn logic_check_file_name(self, file_name: &str) -> String {
        let mut data = file_name.as_bytes();

        if let Some(n) = data.iter().position(|x| *x == b'.') {
            data = &data[..n];
        }
        if data.len() > 16 {
            data = &data[data.len() - 16..];
        }

        self.logic_check_data(data)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Nonce").field(&to_utf8_or_error_string(&self.data)).finish()
    }
}

/// Metadata about one downloadable firmware binary, as returned by the binary
/// inform request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryFileInfo {
    /// Server-side directory of the binary, including the trailing slash
    pub remote_path: String,
    /// File name without any directory component
    pub file_name: String,
    pub size_bytes: u64,
    pub crc32: Option<u32>,
    /// Version as normalized by the server
    pub version: FwVersion,
    /// Friendly OS version name
    pub version_name: String,
    pub platform: String,
    pub model: String,
    /// Marketing name of the model
    pub model_name: String,
    pub model_type: u8,
    pub region: String,
    pub last_modified: String,
    /// Whether this is a factory binary rather than a home binary
    pub binary_nature: bool,
    /// Seed for the V4 firmware key, matching the binary nature
    pub logic_value: Option<String>,
}

impl BinaryFileInfo {
    /// Name of the decrypted image: the file name with an `.enc*` extension
    /// removed. Names without such an extension are returned as is.
    pub fn output_name(&self) -> String {
        let p = Path::new(&self.file_name);

        match (p.file_stem().and_then(|s| s.to_str()), p.extension().and_then(|e| e.to_str())) {
            (Some(stem), Some(ext)) if ext.starts_with("enc") => stem.to_owned(),
            _ => self.file_name.clone(),
        }
    }

    /// Parse the `<FUSBody><Put>` fields of a successful binary inform
    /// response.
    pub fn from_inform_response(root: &Element) -> Result<Self, FusError> {
        macro_rules! get_value {
            ($name:expr) => {
                get_fus_field(root, $name)
                    .ok_or_else(|| FusError::FusMissingField($name.to_owned()))?
            }
        }
        macro_rules! get_optional {
            ($name:expr) => {
                get_fus_field(root, $name)
                    .map(|v| v.trim().to_owned())
                    .filter(|v| !v.is_empty())
            }
        }
        macro_rules! get_parsed {
            ($name:expr) => {
                {
                    let value = get_value!($name);
                    value.trim().parse().map_err(|_| FusError::FusBadField(
                        $name.to_owned(), value.to_string()))?
                }
            }
        }

        let binary_name = get_value!("BINARY_NAME").to_string();
        let file_name = Path::new(&binary_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FusError::FusBadField("BINARY_NAME".to_owned(), binary_name.clone()))?
            .to_owned();

        let crc32 = match get_optional!("BINARY_CRC") {
            Some(v) => Some(v.parse().map_err(|_| FusError::FusBadField(
                "BINARY_CRC".to_owned(), v.clone()))?),
            None => None,
        };

        let binary_nature = get_optional!("BINARY_NATURE").as_deref() == Some("1");
        let logic_value = if binary_nature {
            get_optional!("LOGIC_VALUE_FACTORY")
        } else {
            get_optional!("LOGIC_VALUE_HOME")
        };

        Ok(Self {
            remote_path: get_value!("MODEL_PATH").to_string(),
            file_name,
            size_bytes: get_parsed!("BINARY_BYTE_SIZE"),
            crc32,
            version: get_parsed!("CURRENT_DISPLAY_VERSION"),
            version_name: get_optional!("CURRENT_OS_VERSION").unwrap_or_default(),
            platform: get_optional!("DEVICE_PLATFORM").unwrap_or_default(),
            model: get_value!("DEVICE_MODEL_NAME").to_string(),
            model_name: get_optional!("DEVICE_MODEL_DISPLAYNAME").unwrap_or_default(),
            model_type: get_parsed!("DEVICE_MODEL_TYPE"),
            region: get_value!("DEVICE_LOCAL_CODE").to_string(),
            last_modified: get_optional!("LAST_MODIFIED").unwrap_or_default(),
            binary_nature,
            logic_value,
        })
    }
}

/// Byte stream of a firmware binary plus the digest the server sent with it.
pub struct BinaryStream {
    /// Expected MD5 as lowercase hex, if the server supplied one
    pub md5: Option<String>,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

#[cfg(test)]
impl std::fmt::Debug for BinaryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryStream")
            .field("md5", &self.md5)
            .finish_non_exhaustive()
    }
}

/// Network seam between the job controller and the firmware distribution
/// service. [`FusClient`] is the production implementation.
#[async_trait]
pub trait FirmwareService: Send + Sync + 'static {
    type Session: FirmwareSession;

    /// Perform the authentication handshake, yielding a single-use session.
    async fn open(&self) -> Result<Self::Session, Error>;
}

/// An authenticated session. Every request is signed with the session's
/// current nonce.
#[async_trait]
pub trait FirmwareSession: Send + 'static {
    async fn request_binary_info(
        &mut self,
        identifier: &FirmwareIdentifier,
    ) -> Result<BinaryFileInfo, Error>;

    /// Inform the service that the binary is about to be downloaded.
    async fn init_binary_session(&mut self, info: &BinaryFileInfo) -> Result<(), Error>;

    async fn open_binary(&mut self, info: &BinaryFileInfo) -> Result<BinaryStream, Error>;
}

/// Builder type for creating FUS clients with non-default behavior.
#[derive(Clone)]
pub struct FusClientBuilder {
    keys: FusKeys,
    ignore_tls_validation: bool,
    factory: bool,
    fus_base_url: String,
    download_base_url: String,
}

impl FusClientBuilder {
    pub fn new(keys: FusKeys) -> Self {
        Self {
            keys,
            ignore_tls_validation: false,
            factory: false,
            fus_base_url: FUS_BASE_URL.to_owned(),
            download_base_url: DOWNLOAD_BASE_URL.to_owned(),
        }
    }

    /// Ignore TLS certificate validation when performing HTTPS requests. By
    /// default, TLS certificate validation is enabled.
    pub fn ignore_tls_validation(mut self, value: bool) -> Self {
        self.ignore_tls_validation = value;
        self
    }

    /// Request factory binaries instead of home binaries.
    pub fn factory(mut self, value: bool) -> Self {
        self.factory = value;
        self
    }

    /// Override the base URL of the FUS API endpoints.
    pub fn fus_base_url(mut self, url: &str) -> Self {
        self.fus_base_url = url.trim_end_matches('/').to_owned();
        self
    }

    /// Override the base URL of the binary download endpoint.
    pub fn download_base_url(mut self, url: &str) -> Self {
        self.download_base_url = url.trim_end_matches('/').to_owned();
        self
    }

    pub fn build(&self) -> FusClient {
        FusClient {
            options: self.clone(),
        }
    }
}

/// Entry point for the FUS service. Each [`FirmwareService::open`] call
/// creates a fresh HTTP client (and cookie store) for the new session.
#[derive(Clone)]
pub struct FusClient {
    options: FusClientBuilder,
}

#[async_trait]
impl FirmwareService for FusClient {
    type Session = FusSession;

    async fn open(&self) -> Result<FusSession, Error> {
        Ok(FusSession::connect(&self.options).await?)
    }
}

pub struct FusSession {
    client: reqwest::Client,
    options: FusClientBuilder,
    nonce: Nonce,
}

impl FusSession {
    /// Build an HTTP client and perform the nonce handshake.
    pub async fn connect(options: &FusClientBuilder) -> Result<Self, FusError> {
        debug!("TLS validation enabled: {}", !options.ignore_tls_validation);

        let client = reqwest::ClientBuilder::new()
            .danger_accept_invalid_certs(options.ignore_tls_validation)
            .cookie_store(true)
            .referer(false)
            .build()?;

        let url = format!("{}/NF_DownloadGenerateNonce.do", options.fus_base_url);
        debug!("Requesting nonce from: {url}");

        let r = client.post(&url)
            .header(AUTHORIZATION, Authorization::unsigned().to_string())
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        Self::check_status(&r)?;

        let nonce = Self::response_nonce(&options.keys, &r)
            .ok_or(FusError::NonceNotFound)??;
        debug!("Session established with nonce: {nonce:?}");

        Ok(Self {
            client,
            options: options.clone(),
            nonce,
        })
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    fn response_nonce(keys: &FusKeys, response: &Response) -> Option<Result<Nonce, FusError>> {
        response.headers().get("NONCE")
            .map(|x| Nonce::from_encrypted(keys, x.as_bytes()))
    }

    fn check_status(response: &Response) -> Result<(), FusError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FusError::Rejected(status));
        } else if !status.is_success() {
            return Err(FusError::BadHttpResponse(status));
        }
        Ok(())
    }

    /// Send a signed request. The server may rotate the nonce through the
    /// `NONCE` response header; the new value is used from then on.
    async fn execute_signed(
        &mut self,
        request: RequestBuilder,
        include_nonce: bool,
    ) -> Result<Response, FusError> {
        let auth = self.nonce.to_authorization(&self.options.keys, include_nonce);

        let r = request
            .header(AUTHORIZATION, auth.to_string())
            .send()
            .await?;

        if let Some(nonce) = Self::response_nonce(&self.options.keys, &r) {
            self.nonce = nonce?;
        }
        Self::check_status(&r)?;

        Ok(r)
    }

    /// Send a signed XML request and interpret the FUS status code.
    async fn execute_xml(&mut self, endpoint: &str, body: &Element) -> Result<Element, FusError> {
        let url = format!("{}/{}", self.options.fus_base_url, endpoint);
        debug!("FUS URL: {url}");

        let mut buf = vec![];
        body.write(&mut buf)?;

        debug!("FUS request: {:?}", to_utf8_or_error_string(&buf));

        let request = self.client.post(&url).body(buf);
        let r = self.execute_signed(request, false).await?;
        let data = r.bytes().await?;

        debug!("FUS response: {:?}", to_utf8_or_error_string(&data));

        let root = Element::parse(data.as_ref())?;

        // HTTP 200, but there might still be a FUS error
        let status = get_elem_text(&root, &["FUSBody", "Results", "Status"])
            .ok_or_else(|| FusError::FusBadResponse("Missing FUS status field".to_owned()))?;

        if status.trim() != "200" {
            return Err(FusError::FusStatus(status.trim().to_owned()));
        }

        Ok(root)
    }

    pub async fn binary_inform(
        &mut self,
        identifier: &FirmwareIdentifier,
    ) -> Result<BinaryFileInfo, FusError> {
        let body = create_binary_inform_elem(identifier, self.nonce, self.options.factory);
        let root = self.execute_xml("NF_DownloadBinaryInform.do", &body).await?;

        BinaryFileInfo::from_inform_response(&root)
    }

    pub async fn binary_init(&mut self, info: &BinaryFileInfo) -> Result<(), FusError> {
        let body = create_binary_init_elem(info, self.nonce);
        self.execute_xml("NF_DownloadBinaryInitForMass.do", &body).await?;
        Ok(())
    }

    pub async fn binary_download(&mut self, info: &BinaryFileInfo) -> Result<BinaryStream, FusError> {
        // This intentionally does not use RequestBuilder.query() because FUS
        // returns HTTP 405 if the requested filename is URL-encoded.
        let url = format!(
            "{}/NF_DownloadBinaryForMass.do?file={}{}",
            self.options.download_base_url,
            info.remote_path,
            info.file_name,
        );

        debug!("Requesting binary from: {url}");

        let request = self.client.get(&url).header(RANGE, "bytes=0-");
        let r = self.execute_signed(request, true).await?;

        let status = r.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(FusError::BadHttpResponse(status));
        }

        let md5 = r.headers().get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_md5);
        debug!("Server MD5: {md5:?}");

        let stream = r.bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();

        Ok(BinaryStream { md5, stream })
    }
}

#[async_trait]
impl FirmwareSession for FusSession {
    async fn request_binary_info(
        &mut self,
        identifier: &FirmwareIdentifier,
    ) -> Result<BinaryFileInfo, Error> {
        Ok(self.binary_inform(identifier).await?)
    }

    async fn init_binary_session(&mut self, info: &BinaryFileInfo) -> Result<(), Error> {
        Ok(self.binary_init(info).await?)
    }

    async fn open_binary(&mut self, info: &BinaryFileInfo) -> Result<BinaryStream, Error> {
        Ok(self.binary_download(info).await?)
    }
}

/// Accept either a hex digest or the base64 form defined for `Content-MD5`.
fn normalize_md5(value: &str) -> Option<String> {
    let value = value.trim();

    if value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(value.to_ascii_lowercase());
    }

    match STANDARD.decode(value) {
        Ok(d) if d.len() == 16 => Some(d.iter().map(|b| format!("{b:02x}")).collect()),
        _ => None,
    }
}

fn create_text_node(name: &str, text: &str) -> XMLNode {
    let mut elem = Element::new(name);
    elem.children.push(XMLNode::Text(text.to_owned()));
    XMLNode::Element(elem)
}

fn create_data_node(name: &str, value: &str) -> XMLNode {
    let mut elem = Element::new(name);
    elem.children.push(create_text_node("Data", value));
    XMLNode::Element(elem)
}

fn create_fus_msg(put: Vec<XMLNode>, get_field: &str) -> Element {
    let mut hdr = Element::new("FUSHdr");
    hdr.children.push(create_text_node("ProtoVer", "1.0"));
    hdr.children.push(create_text_node("SessionID", "0"));
    hdr.children.push(create_text_node("MsgID", "1"));

    let mut put_elem = Element::new("Put");
    put_elem.children.push(create_text_node("CmdID", "1"));
    put_elem.children.extend(put);

    let mut get_elem = Element::new("Get");
    get_elem.children.push(create_text_node("CmdID", "2"));
    get_elem.children.push(create_text_node(get_field, ""));

    let mut body = Element::new("FUSBody");
    body.children.push(XMLNode::Element(put_elem));
    body.children.push(XMLNode::Element(get_elem));

    let mut fus_msg = Element::new("FUSMsg");
    fus_msg.children.push(XMLNode::Element(hdr));
    fus_msg.children.push(XMLNode::Element(body));

    fus_msg
}

fn create_binary_inform_elem(identifier: &FirmwareIdentifier, nonce: Nonce, factory: bool) -> Element {
    let version = &identifier.firmware_version;
    let version_str = version.to_string();

    create_fus_msg(vec![
        create_data_node("ACCESS_MODE", "2"),
        create_data_node("BINARY_NATURE", if factory { "1" } else { "0" }),
        create_data_node("CLIENT_PRODUCT", "Smart Switch"),
        create_data_node("DEVICE_MODEL_NAME", &identifier.model),
        create_data_node("DEVICE_LOCAL_CODE", &identifier.region),
        create_data_node("DEVICE_FW_VERSION", &version_str),
        create_data_node("DEVICE_VER_COUNT", "4"),
        create_data_node("DEVICE_PDA_CODE1_VERSION", &version.pda),
        create_data_node("DEVICE_CSC_CODE2_VERSION", &version.csc),
        create_data_node("DEVICE_PHONE_FONT_VERSION", &version.phone),
        create_data_node("DEVICE_CONTENTS_DATA_VERSION", &version.data),
        create_data_node("LOGIC_CHECK", &nonce.logic_check_data(version_str.as_bytes())),
    ], "LATEST_FW_VERSION")
}

fn create_binary_init_elem(info: &BinaryFileInfo, nonce: Nonce) -> Element {
    create_fus_msg(vec![
        create_data_node("DEVICE_MODEL_TYPE", &info.model_type.to_string()),
        create_data_node("BINARY_NATURE", if info.binary_nature { "1" } else { "0" }),
        create_data_node("DEVICE_LOCAL_CODE", &info.region),
        create_data_node("BINARY_VERSION", &info.version.to_string()),
        create_data_node("BINARY_FILE_NAME", &info.file_name),
        create_data_node("LOGIC_CHECK", &nonce.logic_check_file_name(&info.file_name)),
    ], "BINARY_EMERGENCY_OTP_SEND")
}

fn get_elem_text<'a>(elem: &'a Element, path: &[&str]) -> Option<Cow<'a, str>> {
    let mut result = Some(elem);

    for p in path {
        result = result.and_then(|e| e.get_child(*p));
    }

    result.map(|e| e.get_text().unwrap_or(Cow::Borrowed("")))
}

fn get_fus_field<'a>(elem: &'a Element, field: &str) -> Option<Cow<'a, str>> {
    get_elem_text(elem, &["FUSBody", "Put", field, "Data"])
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::TryStreamExt;

    use crate::error::ErrorKind;

    use super::*;

    fn test_keys() -> FusKeys {
        FusKeys::new(
            b"testing_testing_testing_testing_",
            b"testing_testing_",
        ).unwrap()
    }

    const INFORM_RESPONSE: &str = r#"<FUSMsg>
        <FUSHdr><ProtoVer>1.0</ProtoVer></FUSHdr>
        <FUSBody>
            <Results><Status>200</Status></Results>
            <Put>
                <BINARY_NAME><Data>SM-N986U_1_20230101_abc.zip.enc4</Data></BINARY_NAME>
                <BINARY_BYTE_SIZE><Data>1024</Data></BINARY_BYTE_SIZE>
                <BINARY_CRC><Data>3735928559</Data></BINARY_CRC>
                <BINARY_NATURE><Data>0</Data></BINARY_NATURE>
                <CURRENT_DISPLAY_VERSION><Data>N986USQU1/N986UOYN1</Data></CURRENT_DISPLAY_VERSION>
                <CURRENT_OS_VERSION><Data>R(Android 11)</Data></CURRENT_OS_VERSION>
                <DEVICE_PLATFORM><Data>Android</Data></DEVICE_PLATFORM>
                <DEVICE_MODEL_NAME><Data>SM-N986U</Data></DEVICE_MODEL_NAME>
                <DEVICE_MODEL_DISPLAYNAME><Data>Galaxy Note20 Ultra 5G</Data></DEVICE_MODEL_DISPLAYNAME>
                <DEVICE_MODEL_TYPE><Data>9</Data></DEVICE_MODEL_TYPE>
                <DEVICE_LOCAL_CODE><Data>TMB</Data></DEVICE_LOCAL_CODE>
                <MODEL_PATH><Data>/neofus/9/</Data></MODEL_PATH>
                <LAST_MODIFIED><Data>20230101000000</Data></LAST_MODIFIED>
                <LOGIC_VALUE_HOME><Data>abcdefghijklmnop</Data></LOGIC_VALUE_HOME>
                <LOGIC_VALUE_FACTORY><Data>ponmlkjihgfedcba</Data></LOGIC_VALUE_FACTORY>
            </Put>
        </FUSBody>
    </FUSMsg>"#;

    #[test]
    fn test_authorization() {
        assert_eq!(Authorization::unsigned().to_string(),
                   r#"FUS nonce="", signature="", nc="", type="", realm="", newauth="1""#);

        assert_eq!(Authorization::with_signature("abc").to_string(),
                   r#"FUS nonce="", signature="abc", nc="", type="", realm="", newauth="1""#);
    }

    #[test]
    fn test_nonce() {
        let keys = test_keys();

        assert_matches!(Nonce::from_slice(b"testing_testing_"), Ok(_));
        assert_matches!(Nonce::from_slice(b"testing_testing"),
                        Err(FusError::NonceInvalidSize));
        assert_matches!(Nonce::from_slice(b"testing_testing_t"),
                        Err(FusError::NonceInvalidSize));

        assert_eq!(format!("{:?}", Nonce::from_slice(b"\xffesting_testing_").unwrap()),
                   "Nonce(\"[Non-UTF-8 data]\")");

        assert_eq!(Nonce::from_slice(b"testing_testing_").unwrap().to_encrypted(&keys),
                   "yrJiFOygpIxnq4nbWdT2NLk1Odu8m5+zcFKQL4PzV0A=");

        assert_matches!(Nonce::from_encrypted(&keys, b"yrJiFOygpIxnq4nbWdT2NLk1Odu8m5+zcFKQL4PzV0A="),
                        Ok(x) if x == Nonce::from_slice(b"testing_testing_").unwrap());
        assert_matches!(Nonce::from_encrypted(&keys, b"not base64!"),
                        Err(FusError::Base64DecodeError(_)));
    }

    #[test]
    fn test_nonce_signature() {
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        assert_eq!(nonce.to_signature(&test_keys()),
                   "9J2R5S8AAXs40SYA92cLHQfWDv/6w5cAeZkPOEDIFGw=");

        let auth = nonce.to_authorization(&test_keys(), true);
        assert_eq!(auth.nonce, "yrJiFOygpIxnq4nbWdT2NLk1Odu8m5+zcFKQL4PzV0A=");
        assert!(nonce.to_authorization(&test_keys(), false).nonce.is_empty());
    }

    #[test]
    fn test_logic_check_file_name() {
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        assert_eq!(nonce.logic_check_file_name("abc"), "bcabacbabcabacba");
        assert_eq!(nonce.logic_check_file_name("testing_testing_.enc4"), "intieg__intieg__");
        assert_eq!(nonce.logic_check_file_name("testing_testing_testing_.enc4"), "intieg__intieg__");
    }

    #[test]
    fn test_parse_inform_response() {
        let root = Element::parse(INFORM_RESPONSE.as_bytes()).unwrap();
        let info = BinaryFileInfo::from_inform_response(&root).unwrap();

        assert_eq!(info.file_name, "SM-N986U_1_20230101_abc.zip.enc4");
        assert_eq!(info.output_name(), "SM-N986U_1_20230101_abc.zip");
        assert_eq!(info.remote_path, "/neofus/9/");
        assert_eq!(info.size_bytes, 1024);
        assert_eq!(info.crc32, Some(0xdeadbeef));
        assert_eq!(info.version, FwVersion::new("N986USQU1", "N986UOYN1", None, None));
        assert_eq!(info.model_type, 9);
        assert!(!info.binary_nature);
        assert_eq!(info.logic_value.as_deref(), Some("abcdefghijklmnop"));
    }

    #[test]
    fn test_parse_inform_response_without_crc() {
        let xml = INFORM_RESPONSE.replace("<Data>3735928559</Data>", "<Data></Data>");
        let root = Element::parse(xml.as_bytes()).unwrap();

        assert_eq!(BinaryFileInfo::from_inform_response(&root).unwrap().crc32, None);
    }

    #[test]
    fn test_parse_inform_response_bad_fields() {
        let xml = INFORM_RESPONSE.replace("<Data>1024</Data>", "<Data>big</Data>");
        let root = Element::parse(xml.as_bytes()).unwrap();
        assert_matches!(BinaryFileInfo::from_inform_response(&root),
                        Err(FusError::FusBadField(f, v)) if f == "BINARY_BYTE_SIZE" && v == "big");

        let xml = INFORM_RESPONSE.replace("MODEL_PATH", "SOMETHING_ELSE");
        let root = Element::parse(xml.as_bytes()).unwrap();
        assert_matches!(BinaryFileInfo::from_inform_response(&root),
                        Err(FusError::FusMissingField(f)) if f == "MODEL_PATH");
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(Error::from(FusError::NonceNotFound).kind(), ErrorKind::Authentication);
        assert_eq!(Error::from(FusError::FusStatus("408".to_owned())).kind(), ErrorKind::NotFound);
        assert_eq!(Error::from(FusError::FusStatus("401".to_owned())).kind(), ErrorKind::Authentication);
        assert_eq!(Error::from(FusError::FusMissingField("X".to_owned())).kind(), ErrorKind::Protocol);
        assert_eq!(Error::from(FusError::BadHttpResponse(StatusCode::BAD_GATEWAY)).kind(),
                   ErrorKind::Network);
    }

    #[test]
    fn test_normalize_md5() {
        assert_eq!(normalize_md5("D41D8CD98F00B204E9800998ECF8427E").as_deref(),
                   Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(normalize_md5("1B2M2Y8AsgTpgAmY7PhCfg==").as_deref(),
                   Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(normalize_md5("garbage"), None);
    }

    #[test]
    fn test_binary_init_elem() {
        let root = Element::parse(INFORM_RESPONSE.as_bytes()).unwrap();
        let info = BinaryFileInfo::from_inform_response(&root).unwrap();
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        let elem = create_binary_init_elem(&info, nonce);
        assert_eq!(get_fus_field(&elem, "BINARY_FILE_NAME").as_deref(),
                   Some("SM-N986U_1_20230101_abc.zip.enc4"));
        assert_eq!(get_fus_field(&elem, "BINARY_VERSION").as_deref(),
                   Some("N986USQU1/N986UOYN1/N986USQU1/N986USQU1"));
        assert_eq!(get_fus_field(&elem, "LOGIC_CHECK").unwrap(),
                   nonce.logic_check_file_name(&info.file_name));
    }

    async fn mock_session(server: &mut mockito::ServerGuard) -> FusSession {
        let keys = test_keys();
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        server.mock("POST", "/NF_DownloadGenerateNonce.do")
            .with_status(200)
            .with_header("NONCE", &nonce.to_encrypted(&keys))
            .create_async()
            .await;

        let options = FusClientBuilder::new(keys)
            .fus_base_url(&server.url())
            .download_base_url(&server.url());

        FusSession::connect(&options).await.unwrap()
    }

    #[tokio::test]
    async fn test_session_handshake() {
        let mut server = mockito::Server::new_async().await;
        let session = mock_session(&mut server).await;

        assert_eq!(session.nonce(), Nonce::from_slice(b"testing_testing_").unwrap());
    }

    #[tokio::test]
    async fn test_session_handshake_without_nonce() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/NF_DownloadGenerateNonce.do")
            .with_status(200)
            .create_async()
            .await;

        let options = FusClientBuilder::new(test_keys()).fus_base_url(&server.url());
        let result = options.build().open().await;

        assert_matches!(result.map(|_| ()), Err(e) if e.kind() == ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_binary_inform() {
        let mut server = mockito::Server::new_async().await;
        let mut session = mock_session(&mut server).await;

        let mock = server.mock("POST", "/NF_DownloadBinaryInform.do")
            .match_header("authorization", mockito::Matcher::Regex(
                r#"signature="9J2R5S8AAXs40SYA92cLHQfWDv/6w5cAeZkPOEDIFGw=""#.to_owned()))
            .with_status(200)
            .with_body(INFORM_RESPONSE)
            .create_async()
            .await;

        let id = FirmwareIdentifier::new("SM-N986U", "TMB", "N986USQU1/N986UOYN1".parse().unwrap());
        let info = session.request_binary_info(&id).await.unwrap();

        mock.assert_async().await;
        assert_eq!(info.size_bytes, 1024);
    }

    #[tokio::test]
    async fn test_binary_inform_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mut session = mock_session(&mut server).await;

        server.mock("POST", "/NF_DownloadBinaryInform.do")
            .with_status(200)
            .with_body("<FUSMsg><FUSBody><Results><Status>408</Status></Results></FUSBody></FUSMsg>")
            .create_async()
            .await;

        let id = FirmwareIdentifier::new("SM-X000", "XAA", "A/B".parse().unwrap());
        let result = session.request_binary_info(&id).await;

        assert_matches!(result, Err(e) if e.kind() == ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_binary_download() {
        let mut server = mockito::Server::new_async().await;
        let mut session = mock_session(&mut server).await;

        let root = Element::parse(INFORM_RESPONSE.as_bytes()).unwrap();
        let info = BinaryFileInfo::from_inform_response(&root).unwrap();

        server.mock("GET", "/NF_DownloadBinaryForMass.do")
            .match_query(mockito::Matcher::Any)
            .match_header("range", "bytes=0-")
            .with_status(206)
            .with_header("Content-MD5", "5D41402ABC4B2A76B9719D911017C592")
            .with_body("hello")
            .create_async()
            .await;

        let binary = session.open_binary(&info).await.unwrap();
        assert_eq!(binary.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));

        let chunks: Vec<Bytes> = binary.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");
    }

    #[tokio::test]
    async fn test_binary_download_rejects_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        let mut session = mock_session(&mut server).await;

        let root = Element::parse(INFORM_RESPONSE.as_bytes()).unwrap();
        let info = BinaryFileInfo::from_inform_response(&root).unwrap();

        // Successful, but not the full content
        server.mock("GET", "/NF_DownloadBinaryForMass.do")
            .match_query(mockito::Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let result = session.open_binary(&info).await;
        assert_matches!(result, Err(e) if e.kind() == ErrorKind::Network);
    }
}
