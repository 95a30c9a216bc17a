// GB28181 注册鉴权
// HTTP Digest（RFC 2617 简化版，不带 qop），设备侧只支持 MD5

use rand::Rng;

/// nonce 长度（十进制数字）
pub const NONCE_LEN: usize = 32;

/// 摘要算法
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    /// 未知算法，摘要结果为空串，校验必然失败
    Unsupported(String),
}

impl DigestAlgorithm {
    /// 从 Authorization 头的 algorithm 字段解析，缺省为 MD5
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            None => DigestAlgorithm::Md5,
            Some(l) if l.eq_ignore_ascii_case("md5") => DigestAlgorithm::Md5,
            Some(l) => DigestAlgorithm::Unsupported(l.to_string()),
        }
    }
}

/// Digest 校验器
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    algorithm: DigestAlgorithm,
}

impl Authenticator {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> &DigestAlgorithm {
        &self.algorithm
    }

    /// 计算摘要（小写十六进制）
    pub fn digest(&self, input: &str) -> String {
        match self.algorithm {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input)),
            DigestAlgorithm::Unsupported(_) => String::new(),
        }
    }

    /// 校验设备给出的 response
    ///
    /// HA1 = H(username:realm:password)，HA2 = H(method:uri)，
    /// response = H(HA1:nonce:HA2)。任一中间摘要为空时返回 false。
    #[allow(clippy::too_many_arguments)]
    pub fn verify(
        &self,
        username: &str,
        password: &str,
        realm: &str,
        nonce: &str,
        method: &str,
        uri: &str,
        claimed: &str,
    ) -> bool {
        let ha1 = self.digest(&format!("{}:{}:{}", username, realm, password));
        let ha2 = self.digest(&format!("{}:{}", method, uri));
        if ha1.is_empty() || ha2.is_empty() {
            return false;
        }

        let expected = self.digest(&format!("{}:{}:{}", ha1, nonce, ha2));
        expected == claimed
    }
}

/// 解析后的 Authorization 头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestAuthorization {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
}

impl DigestAuthorization {
    /// 解析 `Digest username="..",realm="..",...`
    ///
    /// 引号内的逗号不作为分隔符。缺少 username 或 response 时返回 None。
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let rest = match value.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("digest ") => &value[7..],
            _ => value,
        };

        let mut auth = DigestAuthorization::default();
        for part in split_params(rest) {
            let Some(eq_idx) = part.find('=') else {
                continue;
            };
            let key = part[..eq_idx].trim();
            let mut val = part[eq_idx + 1..].trim();
            if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
                val = &val[1..val.len() - 1];
            }

            match key.to_ascii_lowercase().as_str() {
                "username" => auth.username = val.to_string(),
                "realm" => auth.realm = val.to_string(),
                "nonce" => auth.nonce = val.to_string(),
                "uri" => auth.uri = val.to_string(),
                "response" => auth.response = val.to_string(),
                "algorithm" => auth.algorithm = Some(val.to_string()),
                _ => {}
            }
        }

        if auth.username.is_empty() || auth.response.is_empty() {
            None
        } else {
            Some(auth)
        }
    }
}

fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// 401 响应中的 WWW-Authenticate 头值
pub fn www_authenticate(realm: &str, nonce: &str) -> String {
    format!(
        "Digest realm=\"{}\",algorithm=MD5,nonce=\"{}\"",
        realm, nonce
    )
}

/// 生成 32 位数字 nonce
pub fn generate_nonce() -> String {
    random_digits(NONCE_LEN)
}

/// 生成指定长度的十进制数字串（nonce、tag、Call-ID 共用）
pub fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
