#[rocket::launch]
fn launch() -> _ {
    bot_dispatch::rocket()
}
