//! 对外可访问的文件地址。

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// URL 路径段与 RFC 5987 文件名中保留原样的字符之外全部编码。
pub const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// 根据公开协议、主机与端口构造返回给客户端的 URL。
#[derive(Clone, Debug)]
pub struct Locator {
    base: String,
}

impl Locator {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            base: format!("{protocol}://{host}:{port}"),
        }
    }

    /// 根相对路径对应的完整地址。
    pub fn file_url(&self, relative: &str) -> String {
        format!("{}{}", self.base, files_path(relative))
    }
}

/// 根相对路径对应的 `/files/...` 路径，逐段百分号编码。
pub fn files_path(relative: &str) -> String {
    let encoded = relative
        .trim_start_matches('/')
        .split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/");
    format!("/files/{encoded}")
}
