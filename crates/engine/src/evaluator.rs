//! 资格评估器
//!
//! 纯函数：输入一个族的全部档位、用户已获得的档位集合、用户当前的
//! 累计指标值，输出新可领取的档位列表（按阈值升序）。
//!
//! 阈值是**累计**语义：先剔除已获得的档位，剩余档位按阈值升序
//! 维护一个滚动的阈值和，滚动和不超过指标值的档位才可领取——
//! 解锁第 N 档要求余额足以覆盖前面所有未领取档位的开销，而不只是
//! 第 N 档自身的开销。

use std::collections::HashSet;

use crate::models::TierLike;

/// 计算新可领取的档位
///
/// 返回对入参切片的引用，按阈值升序。不修改任何状态，
/// 发放与否由调用方通过台账决定。
pub fn claimable_tiers<'a, T: TierLike>(
    tiers: &'a [T],
    granted: &HashSet<String>,
    metric_value: i64,
) -> Vec<&'a T> {
    // 先剔除已获得的档位：它们的开销在获得时已经覆盖过，
    // 不再计入剩余档位的滚动和
    let mut remaining: Vec<&T> = tiers
        .iter()
        .filter(|t| !granted.contains(&t.grant_reference()))
        .collect();

    remaining.sort_by_key(|t| t.unlock_threshold());

    let mut claimable = Vec::new();
    let mut running_cost: i64 = 0;

    for tier in remaining {
        running_cost += tier.unlock_threshold();
        if running_cost > metric_value {
            break;
        }
        claimable.push(tier);
    }

    claimable
}

/// 计算朝下一档位的进度百分比
///
/// 用于进度展示：指标值相对下一个尚不可领取档位的累计开销的占比，
/// 向下取整并截断到 [0, 100]。没有剩余档位或全部可领取时返回 100。
pub fn progress_percent<T: TierLike>(
    tiers: &[T],
    granted: &HashSet<String>,
    metric_value: i64,
) -> u8 {
    let mut remaining: Vec<&T> = tiers
        .iter()
        .filter(|t| !granted.contains(&t.grant_reference()))
        .collect();

    if remaining.is_empty() {
        return 100;
    }

    remaining.sort_by_key(|t| t.unlock_threshold());

    let mut running_cost: i64 = 0;
    for tier in remaining {
        running_cost += tier.unlock_threshold();
        if running_cost > metric_value {
            if running_cost <= 0 {
                return 0;
            }
            let pct = (metric_value.max(0) * 100) / running_cost;
            return pct.min(100) as u8;
        }
    }

    100
}
