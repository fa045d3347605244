// 上传运行参数

use super::chunk::DEFAULT_UPLOAD_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// 同时上传的文件数
    pub all_parallel: usize,
    /// 单个文件同时上传的分片数
    pub parallel: usize,
    /// 单个文件的最大重试次数
    pub max_retry: u32,
    /// 禁用秒传
    pub no_rapid_upload: bool,
    /// 整个文件作为一个分片上传
    pub no_split_file: bool,
    /// 输出单文件上传进度
    pub show_progress: bool,
    /// 同名文件先移入回收站再上传
    pub is_overwrite: bool,
    /// 分片大小（字节）
    pub chunk_size: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            all_parallel: 1,
            parallel: 1,
            max_retry: 3,
            no_rapid_upload: false,
            no_split_file: false,
            show_progress: false,
            is_overwrite: false,
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }
}

impl UploadOptions {
    /// 并发数至少为 1，分片大小为 0 时使用默认值
    pub fn normalized(mut self) -> Self {
        self.all_parallel = self.all_parallel.max(1);
        self.parallel = self.parallel.max(1);
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_UPLOAD_CHUNK_SIZE;
        }
        self
    }

    /// 计算校验信息时使用的分片大小，0 表示不分片
    pub fn effective_chunk_size(&self) -> u64 {
        if self.no_split_file {
            0
        } else {
            self.chunk_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = UploadOptions::default();
        assert_eq!(opts.all_parallel, 1);
        assert_eq!(opts.parallel, 1);
        assert_eq!(opts.max_retry, 3);
        assert!(!opts.no_rapid_upload && !opts.no_split_file);
        assert!(!opts.show_progress && !opts.is_overwrite);
    }

    #[test]
    fn test_normalized() {
        let opts = UploadOptions {
            all_parallel: 0,
            parallel: 0,
            chunk_size: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(opts.all_parallel, 1);
        assert_eq!(opts.parallel, 1);
        assert_eq!(opts.chunk_size, DEFAULT_UPLOAD_CHUNK_SIZE);

        let opts = UploadOptions {
            no_split_file: true,
            ..Default::default()
        };
        assert_eq!(opts.effective_chunk_size(), 0);
    }
}
