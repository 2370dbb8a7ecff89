#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use futures::future::BoxFuture;
use x25519_dalek::{PublicKey, StaticSecret};

use box_warden::config::Layout;
use box_warden::network::HttpFetcher;
use box_warden::provision::Arch;
use box_warden::utils::{CommandOutput, CommandRunner};

/// 固定种子的有效 Reality 密钥对 (私钥, 公钥)
pub fn keypair(seed: u8) -> (String, String) {
    let secret = StaticSecret::from([seed; 32]);
    let public = PublicKey::from(&secret);
    (
        general_purpose::URL_SAFE_NO_PAD.encode(secret.to_bytes()),
        general_purpose::URL_SAFE_NO_PAD.encode(public.as_bytes()),
    )
}

/// sing-box generate reality-keypair 的输出格式
pub fn keypair_output(seed: u8) -> String {
    let (private_key, public_key) = keypair(seed);
    format!("PrivateKey: {}\nPublicKey: {}\n", private_key, public_key)
}

pub fn elf_bytes(arch: Arch) -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    bytes[..4].copy_from_slice(b"\x7fELF");
    bytes[4] = 2;
    bytes[5] = 1;
    bytes[18..20].copy_from_slice(&arch.elf_machine().to_le_bytes());
    bytes
}

fn value_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

/// 记录调用并模拟 sing-box / openssl / tar 的假命令执行器
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    keygen_output: Mutex<Option<String>>,
    /// 对应 -newkey 参数中包含此片段的 openssl 调用失败
    failing_openssl: Mutex<Vec<String>>,
    /// tar 解压出的内核内容，None 表示 tar 失败
    tar_payload: Mutex<Option<Vec<u8>>>,
    /// 每次 generate 返回不同的密钥对
    rotating_keys: AtomicBool,
    /// ss -tuln 的输出，None 表示 ss 不可用
    listening: Mutex<Option<String>>,
    binary_name: String,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            keygen_output: Mutex::new(Some(keypair_output(7))),
            failing_openssl: Mutex::new(Vec::new()),
            tar_payload: Mutex::new(None),
            rotating_keys: AtomicBool::new(false),
            listening: Mutex::new(None),
            binary_name: "sing-box".to_string(),
        }
    }

    pub fn with_keygen_output(self, output: Option<&str>) -> Self {
        *self.keygen_output.lock().unwrap() = output.map(str::to_string);
        self
    }

    pub fn failing_openssl(self, fragment: &str) -> Self {
        self.failing_openssl.lock().unwrap().push(fragment.to_string());
        self
    }

    pub fn with_tar_payload(self, payload: Vec<u8>) -> Self {
        *self.tar_payload.lock().unwrap() = Some(payload);
        self
    }

    pub fn with_rotating_keys(self) -> Self {
        self.rotating_keys.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_listening(self, stdout: &str) -> Self {
        *self.listening.lock().unwrap() = Some(stdout.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.first().map(|p| p.ends_with(program)).unwrap_or(false))
            .count()
    }

    pub fn keygen_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.get(1).map(|a| a == "generate").unwrap_or(false))
            .count()
    }

    fn respond(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let program = argv.first().map(String::as_str).unwrap_or_default();

        if argv.get(1).map(String::as_str) == Some("generate") {
            if self.rotating_keys.load(Ordering::SeqCst) {
                // 本次调用已记录在 calls 中
                let seed = 6 + self.keygen_count() as u8;
                return Ok(CommandOutput {
                    exit_code: 0,
                    stdout: keypair_output(seed),
                });
            }
            return Ok(match self.keygen_output.lock().unwrap().clone() {
                Some(stdout) => CommandOutput { exit_code: 0, stdout },
                None => CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                },
            });
        }

        match program {
            "ss" => match self.listening.lock().unwrap().clone() {
                Some(stdout) => Ok(CommandOutput { exit_code: 0, stdout }),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "ss not available")),
            },
            "openssl" => {
                let failing = self.failing_openssl.lock().unwrap().clone();
                if failing.iter().any(|f| argv.iter().any(|a| a.contains(f.as_str()))) {
                    return Ok(CommandOutput {
                        exit_code: 1,
                        stdout: String::new(),
                    });
                }
                for flag in ["-keyout", "-out"] {
                    if let Some(path) = value_after(argv, flag) {
                        std::fs::write(path, format!("fake {}\n", flag))?;
                    }
                }
                Ok(CommandOutput::default())
            }
            "tar" => {
                let Some(payload) = self.tar_payload.lock().unwrap().clone() else {
                    return Ok(CommandOutput {
                        exit_code: 2,
                        stdout: String::new(),
                    });
                };
                let dest = value_after(argv, "-C")
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing -C"))?;
                let dir = Path::new(dest).join("sing-box-1.12.12-linux-amd64");
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join(&self.binary_name), payload)?;
                std::fs::write(dir.join("LICENSE"), "GPL")?;
                Ok(CommandOutput::default())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not available", program),
            )),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<CommandOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(argv.to_vec());
            self.respond(argv)
        })
    }
}

/// 按 URL 返回预设内容的假 HTTP 客户端，未预设的 URL 一律失败
#[derive(Default)]
pub struct FakeFetcher {
    texts: Mutex<HashMap<String, String>>,
    downloads: Mutex<HashMap<String, Vec<u8>>>,
    requested: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, url: &str, body: &str) -> Self {
        self.texts
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        self
    }

    pub fn with_download(self, url: &str, payload: Vec<u8>) -> Self {
        self.downloads
            .lock()
            .unwrap()
            .insert(url.to_string(), payload);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    fn record(&self, url: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(url.to_string());
    }
}

impl HttpFetcher for FakeFetcher {
    fn get_text<'a>(&'a self, url: &'a str, _timeout: Duration) -> BoxFuture<'a, io::Result<String>> {
        Box::pin(async move {
            self.record(url);
            self.texts
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "offline"))
        })
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        _timeout: Duration,
    ) -> BoxFuture<'a, io::Result<u64>> {
        Box::pin(async move {
            self.record(url);
            let payload = self
                .downloads
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "offline"))?;
            std::fs::write(dest, &payload)?;
            Ok(payload.len() as u64)
        })
    }
}

pub fn work_dir(temp: &tempfile::TempDir) -> PathBuf {
    temp.path().join(".singbox")
}

/// 宿主机上的系统程序，例如 false / true
pub fn host_program(name: &str) -> PathBuf {
    ["/bin", "/usr/bin"]
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| path.exists())
        .unwrap_or_else(|| panic!("host program {} not found", name))
}

/// 把宿主机的 ELF 程序放到内核的规范路径，ensure 不再访问网络
pub fn install_engine(layout: &Layout, program: &str) {
    std::fs::create_dir_all(layout.root()).unwrap();
    std::fs::copy(host_program(program), layout.binary()).unwrap();
    std::fs::write(layout.version_file(), "v1.12.12\n").unwrap();
}
