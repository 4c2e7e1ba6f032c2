use super::Database;
use crate::Result;
use arbor_types::DataRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;

impl Database {
    pub fn set_data<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.insert(&DataRecord {
            name: name.to_string(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn get_data<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.find_one::<DataRecord>(name)? {
            Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
            None => Ok(None),
        }
    }

    pub fn remove_data(&self, name: &str) -> Result<()> {
        self.remove::<DataRecord>(name)?;
        Ok(())
    }
}
