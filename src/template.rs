//! 百分号模板：`%name%` 字段替换，`%%` 表示字面量 `%`。

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unbalanced '%' in template: {0}")]
    Unbalanced(String),

    #[error("unknown template field: {0}")]
    UnknownField(String),
}

/// 已校验的 URL 模板。
///
/// 原文保存，每次渲染时扫描；校验只保证每个 `%` 都成对出现。
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        if source.matches('%').count() % 2 != 0 {
            return Err(TemplateError::Unbalanced(source.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
        })
    }

    /// 渲染模板，每个非空字段名的值由 `resolve` 提供。
    pub fn render<F>(&self, mut resolve: F) -> Result<String, TemplateError>
    where
        F: FnMut(&str) -> Result<String, TemplateError>,
    {
        let mut rendered = String::with_capacity(self.source.len());
        let mut inside = false;
        let mut field_start = 0;

        for (index, ch) in self.source.char_indices() {
            if ch != '%' {
                if !inside {
                    rendered.push(ch);
                }
                continue;
            }
            if inside {
                let name = &self.source[field_start..index];
                if name.is_empty() {
                    rendered.push('%');
                } else {
                    rendered.push_str(&resolve(name)?);
                }
            } else {
                field_start = index + ch.len_utf8();
            }
            inside = !inside;
        }

        Ok(rendered)
    }
}
