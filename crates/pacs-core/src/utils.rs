//! 通用工具函数

use crate::{PacsError, Result};
use uuid::Uuid;

/// 生成影像对象键：`<uuid>.<扩展名>`
pub fn generate_object_key(extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        format!("{}.{}", Uuid::new_v4(), extension.to_ascii_lowercase())
    }
}

/// 校验必填文本字段
pub fn require_non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PacsError::Validation(format!("{} must not be blank", field)));
    }
    Ok(())
}

/// 检查设备类型统一为大写（CT, MR, DX ...）
pub fn normalize_modality(modality: &str) -> String {
    modality.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_object_key() {
        let key = generate_object_key("PNG");
        assert!(key.ends_with(".png"));
        assert!(Uuid::parse_str(key.trim_end_matches(".png")).is_ok());

        let key = generate_object_key(".dcm");
        assert!(key.ends_with(".dcm"));
        assert!(!key.contains(".."));
    }

    #[test]
    fn test_require_non_blank() {
        assert!(require_non_blank("fullName", "Jane Doe").is_ok());
        assert!(matches!(
            require_non_blank("fullName", "   "),
            Err(PacsError::Validation(_))
        ));
    }

    #[test]
    fn test_normalize_modality() {
        assert_eq!(normalize_modality(" ct "), "CT");
    }
}
