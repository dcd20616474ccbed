fn main() {
    quizsync_lib::run()
}
