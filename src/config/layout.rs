use std::path::{Path, PathBuf};

/// 工作目录下的固定文件布局
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    binary_name: String,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, binary_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            binary_name: binary_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// sing-box 配置文件，每次 (重)启动前整体重写
    pub fn config_json(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn cert(&self) -> PathBuf {
        self.root.join("cert.pem")
    }

    pub fn cert_key(&self) -> PathBuf {
        self.root.join("private.key")
    }

    /// Reality 密钥文件 (`Key: value` 行)
    pub fn reality_key(&self) -> PathBuf {
        self.root.join("reality_key.txt")
    }

    pub fn uuid_file(&self) -> PathBuf {
        self.root.join("uuid.txt")
    }

    pub fn binary(&self) -> PathBuf {
        self.root.join(&self.binary_name)
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join(format!("{}.version", self.binary_name))
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("singbox.log")
    }

    /// 脱离会话重启后本进程的输出
    pub fn warden_log(&self) -> PathBuf {
        self.root.join("box-warden.log")
    }

    /// 下载的压缩包
    pub fn archive(&self) -> PathBuf {
        self.root.join("download.tar.gz")
    }

    /// 解压临时目录
    pub fn staging(&self) -> PathBuf {
        self.root.join(".extract")
    }
}
