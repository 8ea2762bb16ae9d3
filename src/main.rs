fn main() {
    if let Err(error) = code_tutor_host_lib::run() {
        eprintln!("code-tutor-host: {:#}", error);
        std::process::exit(1);
    }
}
