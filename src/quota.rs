//! 配额账本的纯计算规则。
//!
//! 加锁与持久化由元数据存储负责；这里只判断一次预留或批量写入能否通过。

use serde::Serialize;
use thiserror::Error;

use crate::metadata::UserRow;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("file size {size} exceeds the limit of {limit} bytes")]
    FileTooLarge { size: i64, limit: i64 },
    #[error("quota exceeded: requested {requested} bytes, {remaining} bytes remaining")]
    Exceeded { requested: i64, remaining: i64 },
}

/// 配额快照，供 `GET /api/quota` 返回。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub storage_quota: i64,
    pub storage_used: i64,
    pub temp_storage: i64,
    pub max_file_size: i64,
    pub remaining: i64,
}

impl From<&UserRow> for QuotaSnapshot {
    fn from(user: &UserRow) -> Self {
        Self {
            storage_quota: user.storage_quota,
            storage_used: user.storage_used,
            temp_storage: user.temp_storage,
            max_file_size: user.max_file_size,
            remaining: remaining(user),
        }
    }
}

/// 剩余可用空间，不会为负。
pub fn remaining(user: &UserRow) -> i64 {
    user.storage_quota
        .saturating_sub(user.storage_used)
        .saturating_sub(user.temp_storage)
        .max(0)
}

/// 单文件上限取用户上限与全局上限中较小者。
pub fn file_size_limit(user: &UserRow, global_max: i64) -> i64 {
    user.max_file_size.min(global_max)
}

/// 判断一次预留是否可以通过。调用方必须已持有用户行锁。
pub fn check_reservation(user: &UserRow, bytes: i64, global_max: i64) -> Result<(), QuotaError> {
    let limit = file_size_limit(user, global_max);
    if bytes > limit {
        return Err(QuotaError::FileTooLarge { size: bytes, limit });
    }
    let remaining = remaining(user);
    if bytes > remaining {
        return Err(QuotaError::Exceeded {
            requested: bytes,
            remaining,
        });
    }
    Ok(())
}

/// 批量直传：逐个检查文件大小，再以总和对比剩余空间。返回总字节数。
pub fn check_batch(user: &UserRow, sizes: &[i64], global_max: i64) -> Result<i64, QuotaError> {
    let limit = file_size_limit(user, global_max);
    let mut total: i64 = 0;
    for &size in sizes {
        if size > limit {
            return Err(QuotaError::FileTooLarge { size, limit });
        }
        total = total.saturating_add(size);
    }
    let remaining = remaining(user);
    if total > remaining {
        return Err(QuotaError::Exceeded {
            requested: total,
            remaining,
        });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user(quota: i64, used: i64, temp: i64, max_file: i64) -> UserRow {
        UserRow {
            id: Uuid::new_v4(),
            storage_quota: quota,
            storage_used: used,
            temp_storage: temp,
            max_file_size: max_file,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reservation_beyond_remaining_is_rejected() {
        let user = user(1_000, 300, 200, 10_000);
        assert_eq!(remaining(&user), 500);
        assert_eq!(
            check_reservation(&user, 1_000, i64::MAX),
            Err(QuotaError::Exceeded {
                requested: 1_000,
                remaining: 500
            })
        );
        assert!(check_reservation(&user, 500, i64::MAX).is_ok());
    }

    #[test]
    fn file_limit_uses_the_smaller_ceiling() {
        let user = user(10_000, 0, 0, 800);
        assert_eq!(
            check_reservation(&user, 900, i64::MAX),
            Err(QuotaError::FileTooLarge {
                size: 900,
                limit: 800
            })
        );
        assert_eq!(
            check_reservation(&user, 700, 600),
            Err(QuotaError::FileTooLarge {
                size: 700,
                limit: 600
            })
        );
    }

    #[test]
    fn batch_is_checked_against_its_sum() {
        let user = user(1_000, 0, 0, 600);
        assert_eq!(check_batch(&user, &[400, 500], i64::MAX), Ok(900));
        assert_eq!(
            check_batch(&user, &[600, 500], i64::MAX),
            Err(QuotaError::Exceeded {
                requested: 1_100,
                remaining: 1_000
            })
        );
    }

    #[test]
    fn overcommitted_user_has_no_headroom() {
        let user = user(100, 90, 50, 1_000);
        assert_eq!(remaining(&user), 0);
    }
}
