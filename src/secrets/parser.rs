/// 从 `generate reality-keypair` 输出或持久化文件中解析出的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeys {
    pub private_key: String,
    pub public_key: String,
    /// sing-box 不输出 Short ID，缺失时由调用方生成
    pub short_id: Option<String>,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyParse {
    Parsed(ParsedKeys),
    MissingField(&'static str),
}

#[derive(Clone, Copy)]
enum Field {
    Private,
    Public,
    ShortId,
}

/// 标签归一化：忽略大小写、空格、下划线和连字符
fn classify(label: &str) -> Option<Field> {
    let normalized: String = label
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-' | '\t'))
        .flat_map(char::to_lowercase)
        .collect();
    match normalized.as_str() {
        "privatekey" | "private" => Some(Field::Private),
        // xray x25519 新版本把公钥标记为 Password
        "publickey" | "public" | "password" => Some(Field::Public),
        "shortid" => Some(Field::ShortId),
        _ => None,
    }
}

/// 逐行扫描 `Label: value`，空值视为缺失
pub fn parse_keys(text: &str) -> KeyParse {
    let mut private_key = None;
    let mut public_key = None;
    let mut short_id = None;

    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match classify(label) {
            Some(Field::Private) => private_key = Some(value.to_string()),
            Some(Field::Public) => public_key = Some(value.to_string()),
            Some(Field::ShortId) => short_id = Some(value.to_string()),
            None => {}
        }
    }

    let Some(private_key) = private_key else {
        return KeyParse::MissingField("PrivateKey");
    };
    let Some(public_key) = public_key else {
        return KeyParse::MissingField("PublicKey");
    };

    KeyParse::Parsed(ParsedKeys {
        private_key,
        public_key,
        short_id,
    })
}

/// 持久化格式
pub fn render_keys(private_key: &str, public_key: &str, short_id: &str) -> String {
    format!(
        "PrivateKey: {}\nPublicKey: {}\nShortId: {}\n",
        private_key, public_key, short_id
    )
}
