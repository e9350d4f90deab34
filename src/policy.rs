//! 文件名清理、危险扩展名与 MIME 类型校验。

use std::path::Path;

use crate::config::{BLOCKED_MIME_TYPES, DANGEROUS_EXTENSIONS, MAX_FILENAME_BYTES};
use crate::error::{ApiError, code};

const OCTET_STREAM: &str = "application/octet-stream";
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// 清理上传文件名：只保留最后一段路径，去掉控制字符与保留字符，并限制长度。
pub fn sanitize_filename(name: &str) -> Result<String, ApiError> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    clean_name(last).ok_or_else(|| {
        ApiError::validation(code::INVALID_FILENAME, format!("invalid filename: {name:?}"))
    })
}

/// 清理单个目录名。
pub fn sanitize_segment(segment: &str) -> Result<String, ApiError> {
    clean_name(segment).ok_or_else(|| {
        ApiError::validation(code::INVALID_PATH, format!("invalid folder name: {segment:?}"))
    })
}

fn clean_name(raw: &str) -> Option<String> {
    let replaced: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if RESERVED_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return None;
    }
    Some(truncate_keeping_extension(trimmed, MAX_FILENAME_BYTES))
}

fn truncate_keeping_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= 16 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let budget = max_bytes.saturating_sub(ext.len());
    let mut end = budget.min(stem.len());
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], ext)
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// 扩展名是否在禁止列表中（不区分大小写）。
pub fn is_dangerous_extension(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| DANGEROUS_EXTENSIONS.contains(&ext.as_str()))
}

fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// 声明的 MIME 类型是否可接受。
///
/// 拒绝可执行类型；若扩展名能推断出类型，声明类型的主类型必须与之一致，
/// 防止把脚本伪装成图片上传。`application/octet-stream` 总是放行。
pub fn validate_mime_type(mime: &str, name: &str) -> bool {
    let mime = normalize_mime(mime);
    if mime.is_empty() || mime == OCTET_STREAM {
        return true;
    }
    let Some((top, sub)) = mime.split_once('/') else {
        return false;
    };
    if top.is_empty() || sub.is_empty() {
        return false;
    }
    if BLOCKED_MIME_TYPES.contains(&mime.as_str()) {
        return false;
    }
    let guesses: Vec<_> = mime_guess::from_path(name).iter().collect();
    if guesses.is_empty() {
        return true;
    }
    guesses
        .iter()
        .any(|guess| guess.essence_str() == mime || guess.type_().as_str() == top)
}

/// 最终记录的 MIME 类型：声明值为空或通用二进制时按扩展名推断。
pub fn resolve_mime(declared: Option<&str>, name: &str) -> String {
    let declared = declared.map(normalize_mime).unwrap_or_default();
    if declared.is_empty() || declared == OCTET_STREAM {
        return mime_guess::from_path(name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
    }
    declared
}

/// 依次检查扩展名与 MIME 类型。
pub fn check_file_policy(name: &str, mime: &str) -> Result<(), ApiError> {
    if is_dangerous_extension(name) {
        return Err(ApiError::validation(
            code::DANGEROUS_EXTENSION,
            format!("file type not allowed: {name}"),
        ));
    }
    if !validate_mime_type(mime, name) {
        return Err(ApiError::validation(
            code::MIME_NOT_ALLOWED,
            format!("mime type {mime} not allowed for {name}"),
        ));
    }
    Ok(())
}
