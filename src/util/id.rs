use base64::Engine;
use uuid::Uuid;

pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

pub fn account_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("acc-{}", &s[..12])
}

/// 由显示名称生成 provider id（小写、仅保留字母数字与连字符）。
pub fn provider_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        format!("custom-{}", random_alphanumeric(6))
    } else {
        out
    }
}

/// OAuth state：32 字节随机数，URL-safe base64 编码。
pub fn oauth_state() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn random_u64() -> u64 {
    // 复用 UUID v4 的随机源，避免额外引入 rand/getrandom 依赖。
    let b = *Uuid::new_v4().as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let idx = (random_u64() as usize) % CHARSET.len();
        out.push(CHARSET[idx] as char);
    }
    out
}
