//! `config set/get/delete` over the store-backed key set.

use crate::cli::commands::ConfigCommands;
use crate::store::Store;
use crate::Result;

pub async fn handle_config_command(store: &Store, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            store.set_config(key.as_str(), &value).await?;
            println!("{key} = {value}");
        }
        ConfigCommands::Get { key } => match store.get_config(key.as_str()).await? {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
        ConfigCommands::Delete { key } => {
            store.delete_config(key.as_str()).await?;
            println!("{key} deleted");
        }
    }
    Ok(())
}
