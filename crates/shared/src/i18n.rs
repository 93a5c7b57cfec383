//! 本地化协作方
//!
//! 提供 `translate(key, locale)` 纯函数式查询。翻译缺失或语言不存在时
//! 回退到默认语言，再不行就返回 key 本身——翻译永远不会失败，
//! 因此永远不会阻塞奖励发放。展示层的最终格式化不在本引擎范围内，
//! 这里只负责把成就定义上的 title_key 解析为可读文案。

use std::collections::HashMap;

use tracing::debug;

/// 翻译器
///
/// 词表在启动时一次性装载（运营后台导出的静态文案），
/// 运行期只读，无需加锁。
pub struct Translator {
    default_locale: String,
    /// locale -> (key -> 文案)
    catalogs: HashMap<String, HashMap<String, String>>,
}

impl Translator {
    pub fn new(default_locale: impl Into<String>) -> Self {
        Self {
            default_locale: default_locale.into(),
            catalogs: HashMap::new(),
        }
    }

    /// 装载一种语言的词表
    pub fn with_catalog(
        mut self,
        locale: impl Into<String>,
        entries: HashMap<String, String>,
    ) -> Self {
        self.catalogs.insert(locale.into(), entries);
        self
    }

    /// 查询翻译
    ///
    /// 回退链：目标语言 -> 默认语言 -> key 本身。
    pub fn translate(&self, key: &str, locale: &str) -> String {
        if let Some(catalog) = self.catalogs.get(locale)
            && let Some(text) = catalog.get(key)
        {
            return text.clone();
        }

        if locale != self.default_locale
            && let Some(catalog) = self.catalogs.get(&self.default_locale)
            && let Some(text) = catalog.get(key)
        {
            debug!(key, locale, "翻译缺失，已回退到默认语言");
            return text.clone();
        }

        debug!(key, locale, "翻译缺失且默认语言无此条目，返回 key");
        key.to_string()
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }
}
