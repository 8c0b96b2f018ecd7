//! 字符串相似度
//!
//! 基于 Levenshtein 编辑距离的归一化相似度，用于模型名称模糊匹配

/// 计算两个字符串的编辑距离（按Unicode字符，大小写不敏感）
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let rows = a.len() + 1;
    let cols = b.len() + 1;
    let mut matrix = vec![vec![0usize; cols]; rows];

    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..cols {
        matrix[0][j] = j;
    }

    for i in 1..rows {
        for j in 1..cols {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            matrix[i][j] = (matrix[i - 1][j] + 1) // 删除
                .min(matrix[i][j - 1] + 1) // 插入
                .min(matrix[i - 1][j - 1] + cost); // 替换
        }
    }

    matrix[rows - 1][cols - 1]
}

/// 计算相似度，结果在 [0, 1] 之间并四舍五入到 0.1
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let distance = levenshtein_distance(&a, &b);
    let score = 1.0 - distance as f64 / max_len as f64;
    (score * 10.0).round() / 10.0
}
