// 构建脚本: 静态链接 FFmpeg 时补充系统库
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // 仅在Windows MSVC环境下添加FFmpeg相关库
    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    {
        // Intel QSV 硬件解码
        println!("cargo:rustc-link-lib=dylib=libmfx");

        // dshow 摄像头
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=strmiids");

        // RTSPS / HTTPS 拉流 (TLS)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
