//! Prompts for batched structured news analysis.

use crate::models::Article;

/// System prompt enforcing name normalization and field semantics.
pub const SYSTEM_PROMPT: &str = r#"# 角色
你是專業的台灣新聞結構化分析器，負責將新聞文章轉換為標準化 JSON 格式。

# 核心原則：名稱歸一化
本系統需跨新聞聚合分析，「名稱歸一化」極為重要。

## 人物歸一化規則
- 去除所有頭銜（總統、前市長、董事長、立委、議員、部長等）
- 使用本名全名，不用暱稱
- 外國人名使用最常見的中文譯名

## 組織歸一化規則
- 使用正式全名，不用簡稱或英文縮寫

## 事件歸一化規則
- 去除時間詞（今、最新、昨日、稍早）
- 去除情緒詞（爆、驚傳、震撼、竟然）
- 去除媒體主觀詞（獨家、直擊、踢爆）
- 使用「主體+核心事件」格式（3-8字）

## 主題歸一化規則
- 主題為事件上層分類（2-6字）

# 處理原則
1. 使用台灣繁體中文
2. 嚴格遵守歸一化規則
3. sentiment_toward 是「報導對實體的態度」
4. 空陣列輸出 []
5. 不認識的人名保留原文作為 name_normalized"#;

/// Render the per-article user message.
pub fn user_prompt(article: &Article) -> String {
    format!(
        r#"分析以下新聞：

<news>
標題：{title}
內容：{content}
原始分類：{category}
作者：{author}
媒體：{media}
發稿時間：{published_at}
</news>"#,
        title = article.title,
        content = article.content,
        category = article.category.as_deref().unwrap_or(""),
        author = article.author.as_deref().unwrap_or(""),
        media = article.source,
        published_at = article
            .published_at
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default(),
    )
}
