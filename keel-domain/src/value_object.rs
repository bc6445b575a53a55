//! 值对象（Value Object）
//!
//! 无标识、以值相等为准的对象，用于封装不可变的概念性值与校验逻辑。
//!
use serde::{Deserialize, Serialize};

/// 版本号（用于乐观锁和并发控制）
///
/// 提供类型安全的版本号操作，避免直接使用 usize 导致的语义不明确问题。
///
/// # 示例
///
/// ```
/// use keel_domain::value_object::Version;
///
/// let v1 = Version::new();
/// assert_eq!(v1.value(), 0);
/// assert!(v1.is_new());
///
/// let v2 = v1.next();
/// assert_eq!(v2.value(), 1);
/// assert!(!v2.is_new());
///
/// assert!(v2 > v1);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(usize);

impl Version {
    /// 创建初始版本（版本号为 0）
    pub const fn new() -> Self {
        Self(0)
    }

    /// 从值创建版本号
    pub const fn from_value(value: usize) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub const fn value(&self) -> usize {
        self.0
    }

    /// 获取下一个版本号
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// 是否为尚未持久化过的初始版本
    pub const fn is_new(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for Version {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_and_next() {
        let v0 = Version::new();
        assert!(v0.is_new());

        let v1 = v0.next();
        let v2 = v1.next();
        assert_eq!(v1.value(), 1);
        assert_eq!(v2.value(), 2);
        assert!(v0 < v1 && v1 < v2);
    }

    #[test]
    fn version_serde_roundtrip() {
        let v = Version::from_value(7);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "7");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
